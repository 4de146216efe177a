//! User payloads carried inside protocol messages.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    }
}

/// A published channel message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Bytes counted against the max message size.
    pub fn size(&self) -> usize {
        self.name.as_ref().map_or(0, String::len)
            + self.client_id.as_ref().map_or(0, String::len)
            + self.data.as_ref().map_or(0, value_size)
            + self.extras.as_ref().map_or(0, value_size)
    }

    /// Id of the message this one is a delta against, if it is a delta.
    pub fn delta_base(&self) -> Option<&str> {
        self.extras
            .as_ref()?
            .get("delta")?
            .get("from")?
            .as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceAction {
    Absent,
    Present,
    Enter,
    Leave,
    Update,
}

impl PresenceAction {
    pub fn code(self) -> u8 {
        match self {
            PresenceAction::Absent => 0,
            PresenceAction::Present => 1,
            PresenceAction::Enter => 2,
            PresenceAction::Leave => 3,
            PresenceAction::Update => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PresenceAction::Absent),
            1 => Some(PresenceAction::Present),
            2 => Some(PresenceAction::Enter),
            3 => Some(PresenceAction::Leave),
            4 => Some(PresenceAction::Update),
            _ => None,
        }
    }
}

impl fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresenceAction::Absent => "absent",
            PresenceAction::Present => "present",
            PresenceAction::Enter => "enter",
            PresenceAction::Leave => "leave",
            PresenceAction::Update => "update",
        };
        f.write_str(name)
    }
}

impl Serialize for PresenceAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for PresenceAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        PresenceAction::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown presence action {code}")))
    }
}

/// The `connectionId:msgSerial:index` parts of a server-assigned presence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PresenceId {
    pub msg_serial: u64,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: PresenceAction,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, client_id: impl Into<String>) -> Self {
        Self {
            id: None,
            action,
            client_id: client_id.into(),
            connection_id: String::new(),
            data: None,
            encoding: None,
            timestamp: None,
        }
    }

    /// Key of this member in the channel-wide presence set.
    pub fn member_key(&self) -> String {
        format!("{}:{}", self.client_id, self.connection_id)
    }

    /// True when the id cannot be trusted for ordering: missing, or not
    /// minted by the connection the member belongs to.
    pub fn is_synthesized(&self) -> bool {
        match &self.id {
            Some(id) => self.connection_id.is_empty() || !id.starts_with(&self.connection_id),
            None => true,
        }
    }

    pub fn parse_id(&self) -> Option<PresenceId> {
        let mut parts = self.id.as_deref()?.rsplitn(3, ':');
        let index = parts.next()?.parse().ok()?;
        let msg_serial = parts.next()?.parse().ok()?;
        parts.next()?;
        Some(PresenceId { msg_serial, index })
    }

    pub fn size(&self) -> usize {
        self.client_id.len() + self.data.as_ref().map_or(0, value_size)
    }
}
