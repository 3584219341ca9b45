//! Lock gate and passphrase storage.

mod lock;
mod passphrase;

pub use lock::LockState;
pub use passphrase::PassphraseStore;
