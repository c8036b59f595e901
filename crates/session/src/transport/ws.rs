// STOMP 1.2 over a raw WebSocket (tokio-tungstenite).
//
// Opening a link is two steps: the WebSocket upgrade, then a STOMP
// CONNECT/CONNECTED exchange. Both share one `connect_timeout`. STOMP-level
// heart-beating is disabled (`0,0`); liveness is the application
// HEARTBEAT envelope driven by the controller.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use supportchat_common::protocol::stomp::{self, Command, Decoded, Frame};
use supportchat_common::types::UserId;

use super::{InboundFrame, Link, Transport, TransportError};
use crate::subscription::Subscription;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct StompWsTransport {
    connect_timeout: Duration,
}

impl Default for StompWsTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl StompWsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for StompWsTransport {
    type Link = StompLink;

    async fn open(&self, url: &Url, user_id: UserId) -> Result<StompLink, TransportError> {
        let attempt = async {
            let (mut socket, _) = connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let host = url.host_str().unwrap_or("localhost");
            let connect = connect_frame(host, user_id);
            socket
                .send(Message::Text(connect.encode().into()))
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            let connected = await_connected(&mut socket).await?;
            Ok::<_, TransportError>((socket, connected))
        };

        let (socket, connected) = timeout(self.connect_timeout, attempt).await.map_err(|_| {
            TransportError::Connect(format!("timed out after {:?}", self.connect_timeout))
        })??;

        info!(
            url = %url,
            version = connected.get("version").unwrap_or("unknown"),
            server = connected.get("server").unwrap_or("unknown"),
            "stomp session established"
        );
        Ok(StompLink { socket })
    }
}

pub struct StompLink {
    socket: Socket,
}

impl Link for StompLink {
    async fn send(&mut self, destination: &str, body: String) -> Result<(), TransportError> {
        let frame = send_frame(destination, body);
        trace!(destination, "stomp SEND");
        self.socket.send(Message::Text(frame.encode().into())).await.map_err(io_error)
    }

    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        let frame = subscribe_frame(subscription);
        debug!(id = %subscription.id, destination = %subscription.destination, "stomp SUBSCRIBE");
        self.socket.send(Message::Text(frame.encode().into())).await.map_err(io_error)
    }

    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        loop {
            let message = match self.socket.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(io_error(e)),
            };
            let text = match message {
                Message::Text(text) => text.as_str().to_owned(),
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => text.to_owned(),
                    Err(_) => {
                        warn!(len = bytes.len(), "discarding non-utf8 binary message");
                        continue;
                    }
                },
                Message::Close(close) => {
                    debug!(?close, "server closed websocket");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            let frame = match stomp::decode(&text) {
                Ok(Decoded::Heartbeat) => continue,
                Ok(Decoded::Frame(frame)) => frame,
                Err(error) => {
                    warn!(%error, "discarding malformed stomp frame");
                    continue;
                }
            };
            match frame.command {
                Command::Message => {
                    return Ok(Some(InboundFrame {
                        destination: frame.get("destination").map(str::to_owned),
                        body: frame.body,
                    }));
                }
                Command::Error => {
                    return Err(TransportError::Rejected { message: error_message(&frame) });
                }
                other => trace!(command = %other, "ignoring stomp frame"),
            }
        }
    }

    async fn close(&mut self) {
        let disconnect = Frame::new(Command::Disconnect);
        if let Err(error) = self.socket.send(Message::Text(disconnect.encode().into())).await {
            debug!(%error, "stomp DISCONNECT not delivered");
        }
        if let Err(error) = self.socket.close(None).await {
            debug!(%error, "websocket close failed");
        }
    }
}

async fn await_connected(socket: &mut Socket) -> Result<Frame, TransportError> {
    while let Some(message) = socket.next().await {
        let message = message.map_err(|e| TransportError::Handshake(e.to_string()))?;
        let Message::Text(text) = message else {
            if let Message::Close(close) = message {
                return Err(TransportError::Handshake(format!("closed during handshake: {close:?}")));
            }
            continue;
        };
        match stomp::decode(text.as_str()) {
            Ok(Decoded::Heartbeat) => continue,
            Ok(Decoded::Frame(frame)) => match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => {
                    return Err(TransportError::Rejected { message: error_message(&frame) });
                }
                other => {
                    return Err(TransportError::Handshake(format!(
                        "expected CONNECTED, got {other}"
                    )));
                }
            },
            Err(error) => return Err(TransportError::Handshake(error.to_string())),
        }
    }
    Err(TransportError::Handshake("connection closed before CONNECTED".into()))
}

fn connect_frame(host: &str, user_id: UserId) -> Frame {
    let uid = user_id.to_string();
    Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", host)
        .header("login", uid.clone())
        .header("user", uid)
        .header("heart-beat", "0,0")
}

fn send_frame(destination: &str, body: String) -> Frame {
    Frame::new(Command::Send)
        .header("destination", destination)
        .header("content-type", "application/json")
        .with_body(body)
}

fn subscribe_frame(subscription: &Subscription) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", subscription.id.clone())
        .header("destination", subscription.destination.clone())
        .header("ack", "auto")
}

fn error_message(frame: &Frame) -> String {
    match frame.get("message") {
        Some(message) => message.to_string(),
        None if !frame.body.is_empty() => frame.body.clone(),
        None => "unspecified error".to_string(),
    }
}

fn io_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Io(other.to_string()),
    }
}
