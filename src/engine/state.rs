//! State shared between the authority and the producers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::protocol::RequestQueue;
use crate::security::LockState;

#[derive(Debug)]
pub struct SharedState {
    pub lock: LockState,
    changeset: AtomicU64,
    last_controller_request: Mutex<Instant>,
    shutdown_requested: AtomicBool,
    shutdown: Notify,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            lock: LockState::default(),
            changeset: AtomicU64::new(0),
            last_controller_request: Mutex::new(Instant::now()),
            shutdown_requested: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn changeset(&self) -> u64 {
        self.changeset.load(Ordering::SeqCst)
    }

    /// Record a committed configuration change. Returns the new value.
    pub fn bump_changeset(&self) -> u64 {
        self.changeset.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Note a request from the interactive controller.
    pub fn touch_controller(&self) {
        *self
            .last_controller_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn controller_idle_for(&self) -> Duration {
        self.last_controller_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) was called.
    pub async fn shutdown_requested(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent request is not lost.
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }
}

/// Everything producers need: the queue and the shared state.
#[derive(Debug, Clone, Default)]
pub struct DaemonContext {
    pub queue: Arc<RequestQueue>,
    pub shared: Arc<SharedState>,
}

impl DaemonContext {
    pub fn new() -> Self {
        Self::default()
    }
}
