// supportchat-session: client-side realtime chat session engine.
//
// `ChatSession` owns the connection lifecycle; everything else is a
// component it drives.

pub mod config;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod pending;
pub mod reconnect;
pub mod router;
pub mod subscription;
pub mod transport;

pub use controller::{ChatSession, SessionEvent, SessionOptions};
pub use error::SessionError;
pub use pending::{ChatAck, PendingReply};
pub use transport::{StompWsTransport, Transport};
