//! Connection states and the transitions observers see.

use std::fmt;
use std::time::Duration;

use ripple_config::TimeoutConfig;
use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Outbound messages may be held until the connection can send.
    pub fn queue_events(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized | ConnectionState::Connecting | ConnectionState::Disconnected
        )
    }

    pub fn send_events(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Undecorated time spent in this state before the machine moves on.
    pub fn retry_delay(self, timeouts: &TimeoutConfig) -> Option<Duration> {
        match self {
            ConnectionState::Connecting => Some(timeouts.connect()),
            ConnectionState::Disconnected => Some(timeouts.disconnected_retry()),
            ConnectionState::Suspended => Some(timeouts.suspended_retry()),
            ConnectionState::Closing => Some(timeouts.realtime_request()),
            _ => None,
        }
    }

    /// Reason reported when entering this state without a specific error.
    pub fn default_error(self) -> Option<ErrorInfo> {
        match self {
            ConnectionState::Disconnected => Some(ErrorInfo::disconnected()),
            ConnectionState::Suspended => Some(ErrorInfo::suspended()),
            ConnectionState::Failed => Some(ErrorInfo::failed()),
            ConnectionState::Closing => Some(ErrorInfo::closing()),
            ConnectionState::Closed => Some(ErrorInfo::closed()),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    /// New connection details or an error while staying connected.
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub event: ConnectionEvent,
    /// When the machine will next try to connect, if it will.
    pub retry_in: Option<Duration>,
    pub reason: Option<ErrorInfo>,
}

impl ConnectionStateChange {
    pub(crate) fn new(
        previous: ConnectionState,
        current: ConnectionState,
        retry_in: Option<Duration>,
        reason: Option<ErrorInfo>,
    ) -> Self {
        Self {
            previous,
            current,
            event: ConnectionEvent::State(current),
            retry_in,
            reason,
        }
    }

    pub(crate) fn update(state: ConnectionState, reason: Option<ErrorInfo>) -> Self {
        Self {
            previous: state,
            current: state,
            event: ConnectionEvent::Update,
            retry_in: None,
            reason,
        }
    }
}
