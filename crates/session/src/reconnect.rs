// Reconnect policy: bounded retries with a fixed or capped exponential delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt.
    Fixed,
    /// `interval * 2^failures`, never above `max_delay`.
    Exponential { max_delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    /// Consecutive failed attempts after which the session gives up.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self { interval, max_attempts, backoff: Backoff::Fixed }
    }

    /// Whether another attempt may follow `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Delay before the attempt that follows `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max_delay } => {
                let exp = failures.min(16);
                self.interval.saturating_mul(1u32 << exp).min(max_delay)
            }
        }
    }
}
