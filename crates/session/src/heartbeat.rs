// Heartbeat scheduler: one liveness ping per period while connected.
//
// Deadline-based rather than timer-based: the scheduler only records when
// the next beat is due and the controller's event loop sleeps until then.
// A single `Option<Instant>` means there can never be two live timers.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use supportchat_common::protocol::envelope::Envelope;
use supportchat_common::types::UserId;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HeartbeatScheduler {
    period: Duration,
    next_due: Option<Instant>,
    sent: u64,
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

impl HeartbeatScheduler {
    pub fn new(period: Duration) -> Self {
        Self { period, next_due: None, sent: 0 }
    }

    /// Arm the scheduler; the first beat is due one period from `now`.
    /// Restarts from scratch if already running.
    pub fn start(&mut self, now: Instant) {
        if self.next_due.is_some() {
            trace!("heartbeat restarted");
        }
        self.next_due = Some(now + self.period);
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Beats emitted since construction.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Produce the liveness envelope if a beat is due at `now`, and
    /// schedule the following one. Returns `None` when stopped or early.
    pub fn poll(&mut self, now: Instant, user_id: UserId) -> Option<Envelope> {
        let due = self.next_due?;
        if now < due {
            return None;
        }
        // Schedule from `now` so a stalled loop does not burst beats.
        self.next_due = Some(now + self.period);
        self.sent += 1;
        trace!(user_id = %user_id, beat = self.sent, "heartbeat due");
        Some(Envelope::heartbeat(user_id))
    }
}
