//! The policy authority: the single execution context that mutates the
//! firewall backend.
//!
//! Producers never touch the backend; they enqueue [`Message`]s on the
//! shared [`RequestQueue`]. The authority thread dequeues them in order,
//! runs the handler and answers the request's response slot.

mod handlers;
mod modes;
mod state;

#[cfg(test)]
mod tests;

pub use state::{DaemonContext, SharedState};

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::{BackendError, FirewallBackend};
use crate::concurrency::FileGuard;
use crate::paths::Paths;
use crate::policy::{MachineSettings, Mode, ProfileCatalog, RuleError, Zone};
use crate::protocol::{Message, ProtocolError, RequestQueue};
use crate::security::PassphraseStore;
use crate::store::{SettingsStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

pub struct Authority<B: FirewallBackend> {
    backend: B,
    store: SettingsStore,
    catalog_path: PathBuf,
    catalog: ProfileCatalog,
    zone: Zone,
    machine: MachineSettings,
    mode: Mode,
    passphrase: PassphraseStore,
    guard: FileGuard,
    hosts_file: PathBuf,
    shared: Arc<SharedState>,
    exit_requested: bool,
}

impl<B: FirewallBackend> Authority<B> {
    /// Set up the authority: protect the catalog and passphrase files and
    /// derive the initial lock state. Policy is applied by the first RELOAD.
    pub fn new(backend: B, paths: &Paths, hosts_file: PathBuf, shared: Arc<SharedState>) -> Self {
        let passphrase = PassphraseStore::new(paths.passphrase_file());
        let has_secret = passphrase.has_secret();
        shared.lock.set_has_secret(has_secret);
        shared.lock.set_locked(has_secret);

        let mut authority = Self {
            backend,
            store: SettingsStore::new(&paths.data_dir),
            catalog_path: paths.profile_catalog(),
            catalog: ProfileCatalog::builtin(),
            zone: Zone::new("Public"),
            machine: MachineSettings::default(),
            mode: Mode::Normal,
            passphrase,
            guard: FileGuard::new(),
            hosts_file,
            shared,
            exit_requested: false,
        };

        let catalog_path = authority.catalog_path.clone();
        let passphrase_path = authority.passphrase.path().to_path_buf();
        authority.protect(&catalog_path);
        authority.protect(&passphrase_path);
        authority
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    pub fn machine(&self) -> &MachineSettings {
        &self.machine
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn guard(&self) -> &FileGuard {
        &self.guard
    }

    /// Whether a handler asked for the daemon to stop.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    /// Process one request and build its response.
    pub fn handle(&mut self, request: &Message) -> Message {
        let command = request.command();
        debug!("Handling {:?}", command);
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                warn!("{:?} failed: {}", command, e);
                Message::error(e.to_string())
            }
        }
    }

    /// Consume requests until the queue closes or a handler asks to exit,
    /// then run the shutdown steps.
    ///
    /// Nothing queued behind an exit request reaches the backend; closing the
    /// queue answers those requests with "shutting down".
    pub fn run(mut self, queue: Arc<RequestQueue>) {
        info!("Policy authority started");
        while let Some(request) = queue.dequeue() {
            let response = self.handle(request.message());
            request.respond(response);
            if self.exit_requested {
                self.shared.request_shutdown();
                queue.close();
                break;
            }
        }
        self.shutdown();
        info!("Policy authority stopped");
    }

    /// Save state and release protected files.
    pub fn shutdown(&mut self) {
        if self.zone.drop_until_reboot() {
            debug!("Dropped until-reboot exceptions from zone '{}'", self.zone.name);
        }
        if let Err(e) = self.store.save_zone(&self.zone) {
            warn!("Failed to save zone at shutdown: {}", e);
        }
        if let Err(e) = self.store.save_machine(&self.machine) {
            warn!("Failed to save machine settings at shutdown: {}", e);
        }
        self.guard.release_all();
    }

    fn protect(&mut self, path: &std::path::Path) {
        if let Err(e) = self.guard.protect(path) {
            warn!("Cannot protect {}: {:#}", path.display(), e);
        }
    }

    fn persist_zone(&mut self) -> Result<(), EngineError> {
        self.store.save_zone(&self.zone)?;
        Ok(())
    }
}

impl<B: FirewallBackend + 'static> Authority<B> {
    /// Run the authority on its own thread.
    pub fn spawn(self, queue: Arc<RequestQueue>) -> std::io::Result<AuthorityHandle> {
        let handle = thread::Builder::new()
            .name("policy-authority".into())
            .spawn(move || self.run(queue))?;
        Ok(AuthorityHandle { handle })
    }
}

pub struct AuthorityHandle {
    handle: JoinHandle<()>,
}

impl AuthorityHandle {
    /// Wait up to `timeout` for the authority thread to finish.
    ///
    /// Returns `false` if it is still running when the time is up; the
    /// thread is then left detached.
    pub fn join_timeout(self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Policy authority did not stop within {:?}", timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if self.handle.join().is_err() {
            warn!("Policy authority panicked");
        }
        true
    }
}
