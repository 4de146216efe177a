//! Protocol timer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timer lengths, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Base delay before retrying from `disconnected`; grows with backoff.
    pub disconnected_retry_ms: u64,
    /// Delay before retrying from `suspended`.
    pub suspended_retry_ms: u64,
    /// Base delay before a suspended channel re-attaches.
    pub channel_retry_ms: u64,
    /// How long to wait for a server response to a request.
    pub realtime_request_ms: u64,
    /// Extra allowance for a transport to open before it is abandoned.
    pub preference_connect_ms: u64,
    /// How long the server keeps connection state; past this we go `suspended`.
    pub connection_state_ttl_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            disconnected_retry_ms: 15_000,
            suspended_retry_ms: 30_000,
            channel_retry_ms: 15_000,
            realtime_request_ms: 10_000,
            preference_connect_ms: 6_000,
            connection_state_ttl_ms: 120_000,
        }
    }
}

impl TimeoutConfig {
    pub fn disconnected_retry(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_ms)
    }

    pub fn suspended_retry(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_ms)
    }

    pub fn channel_retry(&self) -> Duration {
        Duration::from_millis(self.channel_retry_ms)
    }

    pub fn realtime_request(&self) -> Duration {
        Duration::from_millis(self.realtime_request_ms)
    }

    pub fn preference_connect(&self) -> Duration {
        Duration::from_millis(self.preference_connect_ms)
    }

    pub fn connection_state_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_state_ttl_ms)
    }

    /// Time allowed for a whole connect attempt.
    pub fn connect(&self) -> Duration {
        self.preference_connect() + self.realtime_request()
    }
}
