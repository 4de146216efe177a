use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    State(ChannelState),
    /// Re-attached or re-entered without a state change.
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub event: ChannelEvent,
    /// Continuity with the previous attachment was preserved.
    pub resumed: bool,
    pub has_backlog: bool,
    pub reason: Option<ErrorInfo>,
}

impl ChannelStateChange {
    pub(crate) fn update(state: ChannelState, resumed: bool, reason: Option<ErrorInfo>) -> Self {
        Self {
            previous: state,
            current: state,
            event: ChannelEvent::Update,
            resumed,
            has_backlog: false,
            reason,
        }
    }
}
