//! The protocol message envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::action::Action;
use super::payload::{Message, PresenceMessage};
use crate::error::ErrorInfo;

/// Bits of `ProtocolMessage::flags`.
pub mod flags {
    pub const HAS_PRESENCE: u32 = 1 << 0;
    pub const HAS_BACKLOG: u32 = 1 << 1;
    pub const RESUMED: u32 = 1 << 2;
    pub const TRANSIENT: u32 = 1 << 4;
    pub const ATTACH_RESUME: u32 = 1 << 5;

    pub const PRESENCE: u32 = 1 << 16;
    pub const PUBLISH: u32 = 1 << 17;
    pub const SUBSCRIBE: u32 = 1 << 18;
    pub const PRESENCE_SUBSCRIBE: u32 = 1 << 19;

    pub const MODES: u32 = PRESENCE | PUBLISH | SUBSCRIBE | PRESENCE_SUBSCRIBE;
}

/// Server-supplied parameters of a connection, sent with CONNECTED.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u32>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn for_channel(action: Action, channel: &str) -> Self {
        Self {
            action,
            channel: Some(channel.to_string()),
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.map(|f| f & flag != 0).unwrap_or(false)
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags = Some(self.flags.unwrap_or(0) | flag);
    }

    /// Channel modes granted by the server, if any were sent.
    pub fn modes(&self) -> u32 {
        self.flags.unwrap_or(0) & flags::MODES
    }

    /// Total payload size, as counted against the max message size.
    pub fn payload_size(&self) -> usize {
        let messages: usize = self
            .messages
            .iter()
            .flatten()
            .map(Message::size)
            .sum();
        let presence: usize = self
            .presence
            .iter()
            .flatten()
            .map(PresenceMessage::size)
            .sum();
        messages + presence
    }
}
