// Caller-facing error taxonomy for the chat session.

use supportchat_common::types::IdentityError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The user identity is not a valid non-negative integer.
    #[error("invalid user identity: {0}")]
    InvalidIdentity(#[from] IdentityError),

    /// The configured endpoint cannot be turned into a WebSocket URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A send was attempted while the session is not `Connected`.
    #[error("not connected")]
    NotConnected,

    /// The transport dropped while the request was in flight.
    #[error("transport lost before a response arrived")]
    TransportLost,

    /// The caller tore the session down while the request was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// No response arrived before the request's deadline.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-zero status.
    #[error("server rejected request (code {code}): {message}")]
    RemoteRejected { code: i64, message: String },

    /// An inbound frame could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    /// Short machine-readable code for logs and CLI output.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidIdentity(_) => "INVALID_IDENTITY",
            Self::InvalidEndpoint(_) => "INVALID_ENDPOINT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::TransportLost => "TRANSPORT_LOST",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::RemoteRejected { .. } => "REMOTE_REJECTED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
        }
    }

    /// Whether resending the same message may succeed.
    pub const fn retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::TransportLost | Self::Timeout | Self::RemoteRejected { .. }
        )
    }
}
