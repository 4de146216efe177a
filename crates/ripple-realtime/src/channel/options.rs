use std::collections::BTreeMap;

use crate::protocol::flags;

/// Capabilities requested when attaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    Presence,
    Publish,
    Subscribe,
    PresenceSubscribe,
}

impl ChannelMode {
    pub fn flag(self) -> u32 {
        match self {
            ChannelMode::Presence => flags::PRESENCE,
            ChannelMode::Publish => flags::PUBLISH,
            ChannelMode::Subscribe => flags::SUBSCRIBE,
            ChannelMode::PresenceSubscribe => flags::PRESENCE_SUBSCRIBE,
        }
    }

    /// Modes present in a flags word.
    pub fn from_flags(bits: u32) -> Vec<ChannelMode> {
        [
            ChannelMode::Presence,
            ChannelMode::Publish,
            ChannelMode::Subscribe,
            ChannelMode::PresenceSubscribe,
        ]
        .into_iter()
        .filter(|mode| bits & mode.flag() != 0)
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Sent with ATTACH.
    pub params: BTreeMap<String, String>,
    pub modes: Vec<ChannelMode>,
    /// Emit an update for every ATTACHED, even a resumed one.
    pub update_on_attached: bool,
}

impl ChannelOptions {
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = ChannelMode>) -> Self {
        self.modes = modes.into_iter().collect();
        self
    }

    pub(crate) fn mode_flags(&self) -> u32 {
        self.modes.iter().fold(0, |bits, mode| bits | mode.flag())
    }
}
