// Pending request table: correlates outbound messages with their replies.
//
// Each entry holds a oneshot sender and a deadline on the Tokio monotonic
// clock. An entry is removed the moment it settles (reply, timeout or bulk
// cancel), so a late reply for the same id finds nothing and is a no-op.
// The controller drives timeouts by sleeping until `next_deadline()` and
// calling `expire()`; there is no per-entry timer to cancel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Default time a caller waits for a correlated reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful server acknowledgement of a correlated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatAck {
    pub message_id: String,
    pub code: i64,
    pub message: Option<String>,
}

pub type Outcome = Result<ChatAck, SessionError>;

struct PendingEntry {
    created_at: Instant,
    deadline: Instant,
    reply_tx: oneshot::Sender<Outcome>,
}

impl PendingEntry {
    fn deliver(self, message_id: &str, outcome: Outcome) {
        let waited = self.created_at.elapsed();
        if self.reply_tx.send(outcome).is_err() {
            debug!(message_id, ?waited, "caller stopped waiting before settlement");
        }
    }
}

#[derive(Default)]
pub struct PendingRequestTable {
    entries: HashMap<String, PendingEntry>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `message_id` and return the handle its caller awaits.
    ///
    /// Registering an id that is already pending replaces the old entry;
    /// the superseded caller is rejected with `Cancelled`.
    pub fn register(&mut self, message_id: String, timeout: Duration, now: Instant) -> PendingReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let entry = PendingEntry { created_at: now, deadline: now + timeout, reply_tx };
        if let Some(previous) = self.entries.insert(message_id.clone(), entry) {
            warn!(message_id = %message_id, "message id collision, superseding pending request");
            previous.deliver(&message_id, Err(SessionError::Cancelled));
        }
        PendingReply { message_id, reply_rx }
    }

    /// Deliver `outcome` to the caller waiting on `message_id`.
    ///
    /// Returns false when no such entry exists: the timeout may already
    /// have fired, or the server echoed a stale id.
    pub fn settle(&mut self, message_id: &str, outcome: Outcome) -> bool {
        match self.entries.remove(message_id) {
            Some(entry) => {
                entry.deliver(message_id, outcome);
                true
            }
            None => {
                debug!(message_id, "response for unknown or expired request ignored");
                false
            }
        }
    }

    /// Reject every entry whose deadline is at or before `now` with `Timeout`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for message_id in &expired {
            if let Some(entry) = self.entries.remove(message_id) {
                warn!(message_id = %message_id, "request timed out");
                entry.deliver(message_id, Err(SessionError::Timeout));
            }
        }
        expired.len()
    }

    /// Reject every outstanding entry with `reason` and empty the table.
    pub fn cancel_all(&mut self, reason: SessionError) -> usize {
        let count = self.entries.len();
        for (message_id, entry) in self.entries.drain() {
            entry.deliver(&message_id, Err(reason.clone()));
        }
        if count > 0 {
            debug!(count, reason = %reason, "cancelled pending requests");
        }
        count
    }

    /// Earliest deadline among outstanding entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Awaitable outcome of a correlated request.
///
/// Resolves exactly once: with the acknowledgement, or with one of
/// `RemoteRejected`, `Timeout`, `TransportLost` or `Cancelled`.
#[derive(Debug)]
pub struct PendingReply {
    message_id: String,
    reply_rx: oneshot::Receiver<Outcome>,
}

impl PendingReply {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Future for PendingReply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.reply_rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The table was dropped with the entry still inside.
            Poll::Ready(Err(_)) => Poll::Ready(Err(SessionError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
