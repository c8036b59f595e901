use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use supportchat_common::protocol::envelope::Envelope;
use supportchat_common::protocol::stomp::{self, Command, Decoded, Frame};
use supportchat_common::types::{ConnectionState, UserId};
use supportchat_session::config::EndpointConfig;
use supportchat_session::subscription::Subscription;
use supportchat_session::transport::{Link, Transport, TransportError};
use supportchat_session::{ChatSession, SessionEvent, SessionOptions, StompWsTransport};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message as WsMessage, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

const STEP: Duration = Duration::from_secs(5);

#[tokio::test]
async fn chat_session_round_trip_over_stomp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");

    let server = tokio::spawn(async move {
        let (mut ws, uri) = accept(&listener).await;

        let connect = read_frame(&mut ws).await;
        assert_eq!(connect.command, Command::Connect);
        assert_eq!(connect.get("accept-version"), Some("1.2"));
        assert_eq!(connect.get("login"), Some("1001"));
        write_frame(&mut ws, Frame::new(Command::Connected).header("version", "1.2")).await;

        let subscribe = read_frame(&mut ws).await;
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.get("destination"), Some("/user/queue/messages"));
        let sub_id = subscribe.get("id").expect("subscription id").to_string();

        let send = read_frame(&mut ws).await;
        assert_eq!(send.command, Command::Send);
        assert_eq!(send.get("destination"), Some("/app/chat"));
        let chat = Envelope::decode(&send.body).expect("chat body is an envelope");
        assert_eq!(chat.content.as_deref(), Some("hello"));

        let ack = json!({
            "type": "CHAT_RESPONSE",
            "messageId": chat.message_id,
            "code": 0,
            "message": "received",
        });
        write_frame(&mut ws, message_frame(&sub_id, &ack.to_string())).await;
        let push = json!({"type": "CHAT", "sender": 0, "senderName": "AI", "content": "How can I help?"});
        write_frame(&mut ws, message_frame(&sub_id, &push.to_string())).await;

        let disconnect = read_frame(&mut ws).await;
        assert_eq!(disconnect.command, Command::Disconnect);
        uri
    });

    let options = SessionOptions {
        endpoint: EndpointConfig { host: "127.0.0.1".into(), port: addr.port(), ..Default::default() },
        ..Default::default()
    };
    let session = ChatSession::new(options, StompWsTransport::new(STEP));
    let mut events = session.events();
    session.connect(UserId::new(1001)).expect("endpoint is valid");

    timeout(STEP, async {
        loop {
            if let SessionEvent::StateChanged(ConnectionState::Connected) = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .expect("session should connect");

    let reply = session.send_chat("hello").expect("connected session accepts chat");
    let ack = timeout(STEP, reply).await.expect("ack before timeout").expect("server accepted");
    assert_eq!(ack.code, 0);
    assert_eq!(ack.message.as_deref(), Some("received"));

    let shown = timeout(STEP, async {
        loop {
            if let SessionEvent::Inbound(envelope) = events.recv().await.unwrap() {
                return envelope;
            }
        }
    })
    .await
    .expect("push should be displayed");
    assert_eq!(shown.content.as_deref(), Some("How can I help?"));
    assert_eq!(shown.sender_name.as_deref(), Some("AI"));

    session.disconnect();
    let uri = timeout(STEP, server).await.expect("server finishes").expect("server assertions hold");
    assert_eq!(uri, "/ws/websocket?uid=1001");
}

#[tokio::test]
async fn stomp_error_during_handshake_is_a_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");

    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        let connect = read_frame(&mut ws).await;
        assert_eq!(connect.command, Command::Connect);
        write_frame(&mut ws, Frame::new(Command::Error).header("message", "unknown user")).await;
    });

    let url = endpoint(addr.port()).url(UserId::new(7)).expect("valid url");
    let result = StompWsTransport::new(STEP).open(&url, UserId::new(7)).await;
    match result {
        Err(TransportError::Rejected { message }) => assert_eq!(message, "unknown user"),
        Err(other) => panic!("expected rejection, got {other}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
    server.await.expect("server assertions hold");
}

#[tokio::test]
async fn connect_to_closed_port_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let port = listener.local_addr().expect("local address").port();
    drop(listener);

    let url = endpoint(port).url(UserId::new(7)).expect("valid url");
    let result = StompWsTransport::new(STEP).open(&url, UserId::new(7)).await;
    assert!(matches!(result, Err(TransportError::Connect(_))));
}

#[tokio::test]
async fn recv_skips_keepalives_and_non_message_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");

    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        read_frame(&mut ws).await;
        write_frame(&mut ws, Frame::new(Command::Connected).header("version", "1.2")).await;
        let subscribe = read_frame(&mut ws).await;
        let sub_id = subscribe.get("id").expect("subscription id").to_string();

        ws.send(WsMessage::Text("\n".into())).await.expect("keepalive");
        write_frame(&mut ws, Frame::new(Command::Receipt).header("receipt-id", "77")).await;
        ws.send(WsMessage::Text("BOGUS\n\n\0".into())).await.expect("garbage frame");
        write_frame(&mut ws, message_frame(&sub_id, r#"{"type":"SYSTEM","content":"welcome"}"#))
            .await;
        ws.close(None).await.expect("close");
    });

    let url = endpoint(addr.port()).url(UserId::new(9)).expect("valid url");
    let mut link = StompWsTransport::new(STEP).open(&url, UserId::new(9)).await.expect("link opens");
    let subscription =
        Subscription { id: "sub-0".into(), destination: "/user/queue/messages".into() };
    link.subscribe(&subscription).await.expect("subscribe");

    let frame = timeout(STEP, link.recv()).await.expect("frame before timeout").expect("recv ok");
    let frame = frame.expect("a MESSAGE frame");
    assert_eq!(frame.destination.as_deref(), Some("/user/queue/messages"));
    assert_eq!(frame.body, r#"{"type":"SYSTEM","content":"welcome"}"#);

    let closed = timeout(STEP, link.recv()).await.expect("close before timeout");
    assert_eq!(closed, Ok(None));
    server.await.expect("server assertions hold");
}

fn endpoint(port: u16) -> EndpointConfig {
    EndpointConfig { host: "127.0.0.1".into(), port, ..Default::default() }
}

fn message_frame(subscription: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .header("destination", "/user/queue/messages")
        .header("subscription", subscription)
        .header("message-id", "1")
        .header("content-type", "application/json")
        .with_body(body)
}

/// Accept one WebSocket client, returning the socket and the request URI.
async fn accept(listener: &TcpListener) -> (ServerSocket, String) {
    let (stream, _) = listener.accept().await.expect("tcp accept");
    let (uri_tx, uri_rx) = std::sync::mpsc::channel();
    let ws = accept_hdr_async(
        stream,
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(request.uri().to_string());
            Ok(response)
        },
    )
    .await
    .expect("websocket handshake");
    (ws, uri_rx.recv().expect("request uri captured"))
}

async fn read_frame(ws: &mut ServerSocket) -> Frame {
    loop {
        let message = timeout(STEP, ws.next())
            .await
            .expect("frame before timeout")
            .expect("client still connected")
            .expect("valid websocket message");
        if let WsMessage::Text(text) = message {
            match stomp::decode(text.as_str()).expect("client sends valid stomp") {
                Decoded::Frame(frame) => return frame,
                Decoded::Heartbeat => continue,
            }
        }
    }
}

async fn write_frame(ws: &mut ServerSocket, frame: Frame) {
    ws.send(WsMessage::Text(frame.encode().into())).await.expect("server write");
}
