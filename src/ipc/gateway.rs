//! Lock gate between peers and the request queue.

use tracing::debug;

use crate::engine::DaemonContext;
use crate::protocol::{Message, PendingRequest};

#[derive(Debug, Clone)]
pub struct Gateway {
    ctx: DaemonContext,
}

impl Gateway {
    pub fn new(ctx: DaemonContext) -> Self {
        Self { ctx }
    }

    /// Answer one peer request.
    ///
    /// Privileged commands are refused with LOCKED while the daemon is
    /// locked, without reaching the authority. Everything else is queued
    /// and the authority's answer is returned verbatim.
    pub async fn handle(&self, request: Message) -> Message {
        let command = request.command();
        if command.is_response() || command.is_internal() {
            return Message::error(format!("{:?} is not accepted from clients", command));
        }
        if command.requires_unlock() && self.ctx.shared.lock.is_locked() {
            debug!("Refusing {:?} while locked", command);
            return Message::locked();
        }

        self.ctx.shared.touch_controller();
        let (pending, response) = PendingRequest::new(request);
        // A closed queue answers the request itself.
        let _ = self.ctx.queue.enqueue(pending);
        response.response().await
    }
}
