//! Listener on the backend's change feed.
//!
//! A network profile switch always schedules a reload. Any other change
//! made by a process other than this daemon schedules one too, which
//! undoes out-of-band tampering.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::{BackendEvent, ChangeKind};
use crate::engine::DaemonContext;
use crate::protocol::Command;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ChangeListener {
    ctx: DaemonContext,
    own_path: String,
}

impl ChangeListener {
    pub fn new(ctx: DaemonContext, own_path: impl Into<String>) -> Self {
        Self {
            ctx,
            own_path: own_path.into(),
        }
    }

    fn is_own(&self, actor: &str) -> bool {
        actor.to_lowercase() == self.own_path.to_lowercase()
    }

    /// React to one event. Returns `true` if a reload was enqueued.
    pub fn handle_event(&self, event: &BackendEvent) -> bool {
        let Some(kind) = event.change_kind() else {
            return false;
        };

        if kind == ChangeKind::ProfileSwitched {
            self.ctx.shared.bump_changeset();
            let queued = self.ctx.queue.enqueue_coalesced(Command::Reload);
            if queued {
                info!("Reloading because a network interface changed profile");
            }
            return queued;
        }

        match event.actor() {
            Some(actor) if self.is_own(actor) => false,
            actor => {
                let queued = self.ctx.queue.enqueue_coalesced(Command::Reload);
                if queued {
                    info!(
                        "Reloading because {} modified the firewall ({:?})",
                        actor.unwrap_or("an unknown process"),
                        kind
                    );
                }
                queued
            }
        }
    }

    /// Consume `events` on a dedicated thread until the feed closes or the
    /// daemon shuts down.
    pub fn spawn(self, events: Receiver<BackendEvent>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("change-listener".into())
            .spawn(move || {
                loop {
                    match events.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => {
                            self.handle_event(&event);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if self.ctx.shared.is_shutdown_requested() || self.ctx.queue.is_closed() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            debug!("Change feed closed");
                            break;
                        }
                    }
                }
            })
    }
}
