// Core domain types shared by the session engine and its front ends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender id the server uses for AI and system pushes.
pub const SYSTEM_SENDER_ID: i64 = 0;

/// Authenticated user identity, as handed over by the login flow.
///
/// Always a non-negative integer that fits the server's signed 64-bit
/// id; serialized as a bare JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct UserId(u64);

impl UserId {
    /// Largest id the server can represent.
    pub const MAX: u64 = i64::MAX as u64;

    /// Every `u32` is in range; wider values go through `TryFrom` or `FromStr`.
    pub const fn new(id: u32) -> Self {
        Self(id as u64)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The id as the server's signed representation. Lossless.
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<UserId> for u64 {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl TryFrom<u64> for UserId {
    type Error = IdentityError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value > Self::MAX {
            return Err(IdentityError::OutOfRange(value.to_string()));
        }
        Ok(Self(value))
    }
}

impl TryFrom<i64> for UserId {
    type Error = IdentityError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| IdentityError::Negative(value))
    }
}

impl FromStr for UserId {
    type Err = IdentityError;

    /// Accepts decimal digits only, surrounding whitespace ignored.
    /// Signs, fractions, exponents and `NaN` are all rejected.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdentityError::NotNumeric(input.to_string()));
        }
        match trimmed.parse::<u64>() {
            Ok(value) if value <= Self::MAX => Ok(Self(value)),
            _ => Err(IdentityError::OutOfRange(input.to_string())),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("user id is empty")]
    Empty,

    #[error("user id `{0}` is not a non-negative integer")]
    NotNumeric(String),

    #[error("user id {0} is negative")]
    Negative(i64),

    #[error("user id `{0}` exceeds the largest server id")]
    OutOfRange(String),
}

/// Connectivity of a chat session. Exactly one state holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted; only an explicit connect leaves this state.
    Failed,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// True while a connection is up or being worked towards.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
