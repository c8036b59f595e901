// Transport abstraction: a factory that opens framed, destination-addressed
// links to the chat server.
//
// The controller only ever talks to `Transport` / `Link`; the production
// implementation is STOMP over WebSocket (`ws::StompWsTransport`), tests
// plug in scripted mocks.

pub mod ws;

use std::future::Future;

use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use supportchat_common::types::UserId;

use crate::subscription::Subscription;

pub use ws::StompWsTransport;

/// One inbound message delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub destination: Option<String>,
    pub body: String,
}

impl InboundFrame {
    pub fn new(body: impl Into<String>) -> Self {
        Self { destination: None, body: body.into() }
    }
}

/// Transport-level failures. Handled inside the controller and surfaced
/// to callers only as connection state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport: connect failed: {0}")]
    Connect(String),

    #[error("transport: handshake failed: {0}")]
    Handshake(String),

    #[error("transport: server rejected connection: {message}")]
    Rejected { message: String },

    #[error("transport: i/o error: {0}")]
    Io(String),

    #[error("transport: link closed")]
    Closed,
}

/// Opens links. All futures are `Send` so the driver can run on a
/// multi-threaded runtime.
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    /// Establish a connection for `user_id` and complete the messaging
    /// handshake. Resolves once the link is ready to subscribe.
    fn open(
        &self,
        url: &Url,
        user_id: UserId,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// A live connection. Owned exclusively by the driver task.
pub trait Link: Send + 'static {
    fn send(
        &mut self,
        destination: &str,
        body: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &mut self,
        subscription: &Subscription,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound message. `Ok(None)` means the peer closed cleanly.
    /// Must be cancel-safe: the driver polls it inside `select!`.
    fn recv(&mut self) -> impl Future<Output = Result<Option<InboundFrame>, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
