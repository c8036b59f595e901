// Wire protocol: STOMP framing plus the JSON envelope carried inside it.

pub mod envelope;
pub mod stomp;

/// Application destination for user chat messages.
pub const CHAT_DESTINATION: &str = "/app/chat";
/// Application destination for liveness pings.
pub const HEARTBEAT_DESTINATION: &str = "/app/heartbeat";
/// Generic per-user queue; the server maps it to the connected identity.
pub const USER_QUEUE_DESTINATION: &str = "/user/queue/messages";
