//! zonewall - a zone-based firewall policy daemon
//!
//! This crate provides:
//! - Policy model: zones, application exceptions, profile templates, rule synthesis
//! - A single-threaded policy authority fed by a FIFO request queue
//! - Firewall backend abstraction with an in-memory implementation
//! - Local IPC with a passphrase lock gate
//! - Periodic and change-driven triggers that keep the policy self-healing

pub mod backend;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod ipc;
pub mod paths;
pub mod policy;
pub mod protocol;
pub mod security;
pub mod store;
pub mod triggers;

pub use config::Config;
