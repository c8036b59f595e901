// Mutable session state shared by the caller-facing handle and the driver.
//
// Lives behind one mutex that is never held across an `.await`. Every
// state transition goes through here so events and side effects stay in
// lockstep with `state`.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use supportchat_common::types::{ConnectionState, UserId};

use super::SessionEvent;
use crate::error::SessionError;
use crate::heartbeat::HeartbeatScheduler;
use crate::pending::PendingRequestTable;
use crate::reconnect::ReconnectPolicy;
use crate::router::{MessageRouter, Route};
use crate::subscription::SubscriptionRegistry;
use crate::transport::TransportError;

/// One queued outbound frame.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub destination: String,
    pub body: String,
}

pub(crate) struct ControllerState {
    pub state: ConnectionState,
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    /// Bumped on every teardown; a driver holding an older epoch is stale.
    pub epoch: u64,
    /// Consecutive failed connect attempts in the current run.
    pub failures: u32,
    pub pending: PendingRequestTable,
    pub heartbeat: HeartbeatScheduler,
    pub subscriptions: SubscriptionRegistry,
    pub router: MessageRouter,
    pub outbound: Option<mpsc::UnboundedSender<Outbound>>,
    pub shutdown: Option<watch::Sender<bool>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ControllerState {
    pub fn new(
        heartbeat: HeartbeatScheduler,
        subscriptions: SubscriptionRegistry,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            user_id: None,
            session_id: None,
            epoch: 0,
            failures: 0,
            pending: PendingRequestTable::new(),
            heartbeat,
            subscriptions,
            router: MessageRouter::new(),
            outbound: None,
            shutdown: None,
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    pub fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "session state changed");
        self.state = next;
        self.emit(SessionEvent::StateChanged(next));
    }

    pub fn ensure_connected(&self) -> Result<UserId, SessionError> {
        match (self.state, self.user_id) {
            (ConnectionState::Connected, Some(user_id)) => Ok(user_id),
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Queue a frame for the driver. Fails when the driver has gone away.
    pub fn enqueue(&self, destination: &str, body: String) -> Result<(), SessionError> {
        let outbound = self.outbound.as_ref().ok_or(SessionError::TransportLost)?;
        outbound
            .send(Outbound { destination: destination.to_string(), body })
            .map_err(|_| SessionError::TransportLost)
    }

    /// Stop per-transport activity: heartbeat, subscription, in-flight requests.
    fn release_transport(&mut self, reason: SessionError) {
        self.heartbeat.stop();
        self.subscriptions.invalidate();
        self.pending.cancel_all(reason);
    }

    pub fn on_connected(&mut self, now: Instant) {
        self.failures = 0;
        self.heartbeat.start(now);
        self.set_state(ConnectionState::Connected);
        if let Some(user_id) = self.user_id {
            info!(user_id = %user_id, "chat session connected");
            self.emit(SessionEvent::Connected { user_id });
        }
    }

    pub fn on_transport_lost(&mut self, error: &TransportError, policy: &ReconnectPolicy) -> Duration {
        warn!(%error, "transport lost, reconnecting");
        self.release_transport(SessionError::TransportLost);
        self.set_state(ConnectionState::Reconnecting);
        self.emit(SessionEvent::Disconnected { reason: error.to_string() });
        policy.delay_for(self.failures)
    }

    /// Record a failed attempt. Returns the delay before the next one, or
    /// `None` once the policy is exhausted and the session has failed.
    pub fn on_attempt_failed(
        &mut self,
        error: &TransportError,
        policy: &ReconnectPolicy,
    ) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        self.subscriptions.invalidate();
        if !policy.allows(self.failures) {
            warn!(%error, attempts = self.failures, "giving up on chat server");
            self.release_transport(SessionError::TransportLost);
            self.set_state(ConnectionState::Failed);
            self.emit(SessionEvent::Failed { attempts: self.failures });
            return None;
        }
        let delay = policy.delay_for(self.failures);
        warn!(
            %error,
            attempt = self.failures,
            max_attempts = policy.max_attempts,
            ?delay,
            "connect attempt failed, retrying"
        );
        self.set_state(ConnectionState::Reconnecting);
        Some(delay)
    }

    /// Caller-initiated teardown. Invalidates the running driver.
    pub fn stop(&mut self, reason: &str) {
        self.epoch += 1;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.outbound = None;
        self.release_transport(SessionError::Cancelled);
        self.session_id = None;
        if self.state != ConnectionState::Disconnected {
            info!(reason, "chat session disconnected");
            self.set_state(ConnectionState::Disconnected);
            self.emit(SessionEvent::Disconnected { reason: reason.to_string() });
        }
    }

    /// Route one inbound frame body and apply the result.
    pub fn dispatch(&mut self, body: &str) {
        match self.router.route_frame(body, &self.pending) {
            Route::Reply { message_id, outcome } => {
                self.pending.settle(&message_id, outcome);
            }
            Route::Display(envelope) => self.emit(SessionEvent::Inbound(envelope)),
            Route::HeartbeatAck => debug!("heartbeat acknowledged"),
            Route::SessionAssigned { session_id: Some(session_id) } => {
                info!(session_id = %session_id, "server assigned chat session");
                self.session_id = Some(session_id.clone());
                self.emit(SessionEvent::SessionAssigned { session_id });
            }
            Route::SessionAssigned { session_id: None } => {
                debug!("user connect acknowledged without a session id");
            }
            Route::SessionRefused { message } => {
                warn!(message = message.as_deref().unwrap_or(""), "server refused user connect");
            }
            Route::Suppressed(_) | Route::Dropped { .. } => {}
        }
    }
}
