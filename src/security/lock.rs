use std::sync::atomic::{AtomicBool, Ordering};

/// Lock gate shared by the IPC gateway, the ticker and the authority.
#[derive(Debug, Default)]
pub struct LockState {
    locked: AtomicBool,
    has_secret: AtomicBool,
}

impl LockState {
    /// Initial state: locked exactly when a passphrase exists.
    pub fn new(has_secret: bool) -> Self {
        Self {
            locked: AtomicBool::new(has_secret),
            has_secret: AtomicBool::new(has_secret),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn has_secret(&self) -> bool {
        self.has_secret.load(Ordering::SeqCst)
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn set_has_secret(&self, has_secret: bool) {
        self.has_secret.store(has_secret, Ordering::SeqCst);
    }
}
