// Client configuration file: `~/.supportchat/config.toml`.
//
// Every section and field is optional; missing values fall back to the
// defaults the chat server is deployed with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use supportchat_common::protocol::{CHAT_DESTINATION, HEARTBEAT_DESTINATION, USER_QUEUE_DESTINATION};
use supportchat_common::types::UserId;

use crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use crate::pending::DEFAULT_REQUEST_TIMEOUT;
use crate::reconnect::{
    Backoff, BackoffKind, ReconnectPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_RECONNECT_DELAY,
    DEFAULT_RECONNECT_INTERVAL,
};
use crate::transport::ws::DEFAULT_CONNECT_TIMEOUT;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 11005;
/// Raw-WebSocket leg of the server's SockJS endpoint `/ws`.
pub const DEFAULT_PATH: &str = "/ws/websocket";

/// Root directory for client state: `~/.supportchat/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".supportchat"))
}

/// Path to the config file: `~/.supportchat/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Client config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: EndpointConfig,
    pub destinations: DestinationConfig,
    pub session: SessionTuning,
}

impl ClientConfig {
    /// Load from `~/.supportchat/config.toml`. Returns defaults if the
    /// file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

// ── Endpoint ───────────────────────────────────────────────────────

/// Where the chat server listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Use `wss`; set when the hosting page is served over https.
    pub secure: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.into(),
            secure: false,
        }
    }
}

impl EndpointConfig {
    /// `{ws|wss}://{host}:{port}{path}?uid={user_id}`
    pub fn url(&self, user_id: UserId) -> Result<Url, ConfigError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConfigError::InvalidEndpoint("host is empty".into()));
        }
        let mut url = Url::parse(&format!("{scheme}://{host}:{}", self.port))
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{host}:{}: {e}", self.port)))?;
        let path = self.path.trim();
        if path.starts_with('/') {
            url.set_path(path);
        } else {
            url.set_path(&format!("/{path}"));
        }
        url.query_pairs_mut().append_pair("uid", &user_id.to_string());
        Ok(url)
    }
}

// ── Destinations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DestinationConfig {
    pub chat: String,
    pub heartbeat: String,
    /// Per-user queue the server routes replies and pushes to.
    pub inbound: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            chat: CHAT_DESTINATION.into(),
            heartbeat: HEARTBEAT_DESTINATION.into(),
            inbound: USER_QUEUE_DESTINATION.into(),
        }
    }
}

// ── Session tuning ─────────────────────────────────────────────────

/// Timers and retry limits, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionTuning {
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffKind,
    /// Upper bound for exponential backoff; ignored for `fixed`.
    pub max_reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: millis(DEFAULT_RECONNECT_INTERVAL),
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffKind::Fixed,
            max_reconnect_delay_ms: millis(DEFAULT_MAX_RECONNECT_DELAY),
            heartbeat_interval_ms: millis(DEFAULT_HEARTBEAT_INTERVAL),
            request_timeout_ms: millis(DEFAULT_REQUEST_TIMEOUT),
            connect_timeout_ms: millis(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

impl SessionTuning {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            },
        };
        ReconnectPolicy {
            interval: Duration::from_millis(self.reconnect_interval_ms),
            max_attempts: self.max_reconnect_attempts,
            backoff,
        }
    }

    /// Zero would spin the event loop; clamp to 1 ms.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("could not determine home directory")]
    NoHomeDir,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}
