//! Local IPC: the lock gate, the socket server and the controller client.

mod client;
mod gateway;
mod server;

pub use client::IpcClient;
pub use gateway::Gateway;
pub use server::IpcServer;
