// JSON message envelope exchanged with the chat server.
//
// One envelope travels in the body of each STOMP SEND/MESSAGE frame.
// Every field except `type` may be absent; absence decodes as `None`.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{UserId, SYSTEM_SENDER_ID};

/// Length of the random suffix in generated message ids.
const MESSAGE_ID_SUFFIX_LEN: usize = 9;

/// Discriminator carried in the envelope's `type` field.
///
/// Values the client does not know are kept as `Unknown` so the router
/// can drop them with a diagnostic instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    Chat,
    ChatResponse,
    System,
    AiResponse,
    Heartbeat,
    HeartbeatResponse,
    UserConnect,
    UserConnectResponse,
    /// Missing or unrecognized `type`.
    Unknown(String),
}

impl Default for EnvelopeType {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl EnvelopeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chat => "CHAT",
            Self::ChatResponse => "CHAT_RESPONSE",
            Self::System => "SYSTEM",
            Self::AiResponse => "AI_RESPONSE",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatResponse => "HEARTBEAT_RESPONSE",
            Self::UserConnect => "USER_CONNECT",
            Self::UserConnectResponse => "USER_CONNECT_RESPONSE",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "CHAT" => Self::Chat,
            "CHAT_RESPONSE" => Self::ChatResponse,
            "SYSTEM" => Self::System,
            "AI_RESPONSE" => Self::AiResponse,
            "HEARTBEAT" => Self::Heartbeat,
            "HEARTBEAT_RESPONSE" => Self::HeartbeatResponse,
            "USER_CONNECT" => Self::UserConnect,
            "USER_CONNECT_RESPONSE" => Self::UserConnectResponse,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EnvelopeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EnvelopeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Who an envelope claims to come from.
///
/// The server sends numeric user ids; older builds tag AI and system
/// pushes with a string instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sender {
    Id(i64),
    Tag(String),
}

impl Sender {
    /// True for the AI/system identity: id `0`, or the tags `"0"`,
    /// `"ai"` and `"system"`.
    pub fn is_system(&self) -> bool {
        match self {
            Self::Id(id) => *id == SYSTEM_SENDER_ID,
            Self::Tag(tag) => matches!(tag.as_str(), "0" | "ai" | "system"),
        }
    }
}

impl From<UserId> for Sender {
    fn from(id: UserId) -> Self {
        Self::Id(id.as_i64())
    }
}

/// One discrete JSON message unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: EnvelopeType,
    /// Correlation id; only on request- or response-carrying envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Status code; `0` is success. Only on `CHAT_RESPONSE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Human-readable status text accompanying `code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Unix epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Envelope {
    pub fn new(kind: EnvelopeType) -> Self {
        Self { kind, ..Default::default() }
    }

    /// User chat message expecting a `CHAT_RESPONSE` with the same id.
    pub fn chat(message_id: impl Into<String>, content: impl Into<String>, sender: UserId) -> Self {
        Self {
            kind: EnvelopeType::Chat,
            message_id: Some(message_id.into()),
            content: Some(content.into()),
            sender: Some(sender.into()),
            timestamp: Some(now_millis()),
            ..Default::default()
        }
    }

    /// Liveness ping for the heartbeat destination.
    pub fn heartbeat(user_id: UserId) -> Self {
        Self {
            kind: EnvelopeType::Heartbeat,
            user_id: Some(user_id),
            timestamp: Some(now_millis()),
            ..Default::default()
        }
    }

    /// Announces the user so the server can assign a session id.
    pub fn user_connect(user_id: UserId) -> Self {
        Self {
            kind: EnvelopeType::UserConnect,
            user_id: Some(user_id),
            timestamp: Some(now_millis()),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a client-side correlation id: `msg_<millis>_<random>`.
///
/// Unique within a session with overwhelming probability.
pub fn generate_message_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("msg_{}_{}", now_millis(), &random[..MESSAGE_ID_SUFFIX_LEN])
}
