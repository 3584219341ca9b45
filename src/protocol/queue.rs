//! Multi-producer, single-consumer FIFO of pending requests.
//!
//! Producers (IPC connections, the ticker, the change listener) enqueue from
//! any thread; the policy authority is the only consumer. Each request owns
//! a one-shot response slot that is completed exactly once: either by the
//! authority, or with a "shutting down" error when the request is dropped
//! unanswered (queue closed, authority gone).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use super::{Command, Message, SHUTTING_DOWN};

/// A message paired with its single-assignment response slot.
#[derive(Debug)]
pub struct PendingRequest {
    message: Message,
    responder: Option<oneshot::Sender<Message>>,
}

/// Receiving side of a [`PendingRequest`]'s response slot.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<Message>,
}

impl PendingRequest {
    pub fn new(message: Message) -> (Self, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                responder: Some(tx),
            },
            ResponseHandle { rx },
        )
    }

    /// A request nobody waits on (internal triggers).
    pub fn detached(message: Message) -> Self {
        Self {
            message,
            responder: None,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn command(&self) -> Command {
        self.message.command()
    }

    /// Complete the request. Consumes it, so a second answer is impossible.
    pub fn respond(mut self, response: Message) {
        if let Some(tx) = self.responder.take() {
            // The waiter may have gone away (client disconnected); nothing to do then.
            let _ = tx.send(response);
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(Message::error(SHUTTING_DOWN));
        }
    }
}

impl ResponseHandle {
    /// Wait for the response from async code.
    pub async fn response(self) -> Message {
        self.rx
            .await
            .unwrap_or_else(|_| Message::error(SHUTTING_DOWN))
    }

    /// Wait for the response from a plain thread.
    ///
    /// Must not be called from inside a Tokio runtime.
    pub fn blocking_response(self) -> Message {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Message::error(SHUTTING_DOWN))
    }
}

/// Returned when enqueuing into a closed queue. The rejected request has
/// already been answered with a "shutting down" error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request queue is closed")]
pub struct QueueClosed;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<PendingRequest>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a request and wake the consumer.
    pub fn enqueue(&self, request: PendingRequest) -> Result<(), QueueClosed> {
        let mut state = self.state();
        if state.closed {
            drop(state);
            drop(request);
            return Err(QueueClosed);
        }
        state.items.push_back(request);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Non-blocking scan for a pending command of the given kind.
    pub fn has_pending(&self, command: Command) -> bool {
        self.state()
            .items
            .iter()
            .any(|item| item.command() == command)
    }

    /// Enqueue a detached `command` unless one is already waiting.
    ///
    /// The check and the insert happen under one lock, so concurrent
    /// triggers cannot both slip a duplicate in. Returns `true` if a new
    /// entry was added.
    pub fn enqueue_coalesced(&self, command: Command) -> bool {
        let mut state = self.state();
        if state.closed || state.items.iter().any(|item| item.command() == command) {
            return false;
        }
        state
            .items
            .push_back(PendingRequest::detached(Message::new(command)));
        drop(state);
        self.available.notify_one();
        true
    }

    /// Block until a request is available. Returns `None` once the queue is
    /// closed.
    pub fn dequeue(&self) -> Option<PendingRequest> {
        let mut state = self.state();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Close the queue: wake the consumer and answer every waiting request
    /// with a "shutting down" error.
    pub fn close(&self) {
        let abandoned: Vec<PendingRequest> = {
            let mut state = self.state();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.available.notify_all();
        if !abandoned.is_empty() {
            tracing::debug!("Abandoning {} queued request(s) at shutdown", abandoned.len());
        }
        drop(abandoned);
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
