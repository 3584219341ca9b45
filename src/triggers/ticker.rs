//! Periodic ticker: schedules expiry sweeps and the inactivity auto-lock.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::engine::DaemonContext;
use crate::protocol::Command;

pub struct Ticker {
    ctx: DaemonContext,
    interval: Duration,
    inactivity_lock: Option<Duration>,
}

/// What a single tick enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub expiry_check: bool,
    pub lock: bool,
}

impl Ticker {
    /// `inactivity_lock` of zero disables the auto-lock.
    pub fn new(ctx: DaemonContext, interval: Duration, inactivity_lock: Duration) -> Self {
        Self {
            ctx,
            interval,
            inactivity_lock: (!inactivity_lock.is_zero()).then_some(inactivity_lock),
        }
    }

    pub fn tick(&self) -> TickOutcome {
        let expiry_check = self.ctx.queue.enqueue_coalesced(Command::CheckScheduledRules);

        let shared = &self.ctx.shared;
        let lock = match self.inactivity_lock {
            Some(window)
                if shared.lock.has_secret()
                    && !shared.lock.is_locked()
                    && shared.controller_idle_for() >= window =>
            {
                let queued = self.ctx.queue.enqueue_coalesced(Command::Lock);
                if queued {
                    info!("Controller idle for {:?}, locking", window);
                }
                queued
            }
            _ => false,
        };

        TickOutcome { expiry_check, lock }
    }

    /// Tick every interval until shutdown is requested.
    pub async fn run(&self) {
        debug!("Starting ticker with interval: {:?}", self.interval);
        loop {
            tokio::select! {
                _ = sleep(self.interval) => {
                    self.tick();
                }
                _ = self.ctx.shared.shutdown_requested() => break,
            }
        }
        debug!("Ticker stopped");
    }
}
