// Message router: decides where each inbound envelope goes.
//
// Classification is pure; the controller applies the resulting `Route`.
// Nothing in here may fail the event loop: malformed or unexpected
// frames become a `Route::Dropped` and processing moves on.

use tracing::{debug, warn};

use supportchat_common::protocol::envelope::{Envelope, EnvelopeType};

use crate::error::SessionError;
use crate::pending::{ChatAck, Outcome, PendingRequestTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Correlated reply for a pending request.
    Reply { message_id: String, outcome: Outcome },
    /// Push for the display observers.
    Display(Envelope),
    /// Server acknowledged a heartbeat.
    HeartbeatAck,
    /// Server assigned (or refused) a session for `USER_CONNECT`.
    SessionAssigned { session_id: Option<String> },
    SessionRefused { message: Option<String> },
    /// CHAT push from a sender other than the system/AI identity.
    Suppressed(Envelope),
    Dropped { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Replies that matched a live pending request.
    pub replies: u64,
    /// Replies whose request already settled, timed out or never existed.
    pub stale: u64,
    pub displayed: u64,
    pub bookkeeping: u64,
    pub suppressed: u64,
    pub dropped: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
pub struct MessageRouter {
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Decode a raw frame body and classify it.
    pub fn route_frame(&mut self, body: &str, pending: &PendingRequestTable) -> Route {
        match Envelope::decode(body) {
            Ok(envelope) => self.route(envelope, pending),
            Err(error) => {
                self.stats.malformed += 1;
                let error = SessionError::Protocol(error.to_string());
                warn!(%error, "discarding inbound frame");
                Route::Dropped { reason: error.to_string() }
            }
        }
    }

    pub fn route(&mut self, envelope: Envelope, pending: &PendingRequestTable) -> Route {
        let route = classify(envelope, pending);
        match &route {
            Route::Reply { message_id, .. } => {
                if pending.contains(message_id) {
                    self.stats.replies += 1;
                } else {
                    self.stats.stale += 1;
                    debug!(%message_id, "reply for a request that is no longer pending");
                }
            }
            Route::Display(_) => self.stats.displayed += 1,
            Route::HeartbeatAck | Route::SessionAssigned { .. } | Route::SessionRefused { .. } => {
                self.stats.bookkeeping += 1
            }
            Route::Suppressed(envelope) => {
                self.stats.suppressed += 1;
                debug!(sender = ?envelope.sender, "suppressed chat push from non-system sender");
            }
            Route::Dropped { reason } => {
                self.stats.dropped += 1;
                warn!(reason = %reason, "dropped inbound envelope");
            }
        }
        route
    }
}

fn classify(envelope: Envelope, pending: &PendingRequestTable) -> Route {
    let correlated = envelope
        .message_id
        .as_deref()
        .filter(|id| envelope.kind != EnvelopeType::ChatResponse && pending.contains(id))
        .map(str::to_string);
    if let Some(message_id) = correlated {
        return Route::Reply { outcome: reply_outcome(&envelope, &message_id), message_id };
    }

    match &envelope.kind {
        EnvelopeType::ChatResponse => match envelope.message_id.clone() {
            Some(message_id) => Route::Reply { outcome: reply_outcome(&envelope, &message_id), message_id },
            None => Route::Dropped { reason: "CHAT_RESPONSE without messageId".into() },
        },
        EnvelopeType::Chat => {
            if envelope.sender.as_ref().is_some_and(|sender| sender.is_system()) {
                Route::Display(envelope)
            } else {
                Route::Suppressed(envelope)
            }
        }
        EnvelopeType::System | EnvelopeType::AiResponse => Route::Display(envelope),
        EnvelopeType::HeartbeatResponse => Route::HeartbeatAck,
        EnvelopeType::UserConnectResponse => {
            if envelope.success == Some(false) {
                Route::SessionRefused { message: envelope.message }
            } else {
                Route::SessionAssigned { session_id: envelope.session_id }
            }
        }
        EnvelopeType::Heartbeat | EnvelopeType::UserConnect => Route::Dropped {
            reason: format!("client-bound {} frame is not expected inbound", envelope.kind),
        },
        EnvelopeType::Unknown(raw) => Route::Dropped { reason: format!("unknown envelope type `{raw}`") },
    }
}

/// `code == 0` (or absent) is success; anything else is a rejection.
fn reply_outcome(envelope: &Envelope, message_id: &str) -> Outcome {
    match envelope.code.unwrap_or(0) {
        0 => Ok(ChatAck {
            message_id: message_id.to_string(),
            code: 0,
            message: envelope.message.clone(),
        }),
        code => Err(SessionError::RemoteRejected {
            code,
            message: envelope.message.clone().unwrap_or_default(),
        }),
    }
}
