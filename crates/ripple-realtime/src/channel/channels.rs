use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::options::ChannelOptions;
use super::realtime_channel::{ChannelBuses, RealtimeChannel};
use super::state::ChannelState;
use crate::codec::MessageCodec;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::ErrorInfo;
use crate::protocol::ProtocolMessage;
use crate::timers::{Scheduler, TimerFired, TimerOwner};

/// Every channel the client knows about, by name.
pub(crate) struct Channels {
    all: HashMap<String, RealtimeChannel>,
    codec: Arc<dyn MessageCodec>,
    scheduler: Scheduler,
}

impl Channels {
    pub fn new(codec: Arc<dyn MessageCodec>, scheduler: Scheduler) -> Self {
        Self {
            all: HashMap::new(),
            codec,
            scheduler,
        }
    }

    pub fn get_or_create(
        &mut self,
        name: &str,
        options: ChannelOptions,
        buses: Option<ChannelBuses>,
    ) -> &mut RealtimeChannel {
        match self.all.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let channel = entry.into_mut();
                if channel.options != options {
                    debug!(channel = %name, "Channel options replaced; applied on next attach");
                    channel.options = options;
                }
                if let Some(buses) = buses {
                    channel.adopt_buses(buses);
                }
                channel
            }
            Entry::Vacant(entry) => {
                debug!(channel = %name, "Creating channel");
                entry.insert(RealtimeChannel::new(
                    name,
                    options,
                    self.codec.clone(),
                    self.scheduler.clone(),
                    buses.unwrap_or_else(ChannelBuses::new),
                ))
            }
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut RealtimeChannel> {
        self.all.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Drop a channel. Only channels that hold no server-side attachment
    /// can be released.
    pub fn release(&mut self, name: &str) -> Result<(), ErrorInfo> {
        if let Some(channel) = self.all.get(name) {
            channel.check_releasable()?;
            self.all.remove(name);
            info!(channel = %name, "Channel released");
        }
        Ok(())
    }

    pub fn process_channel_message(&mut self, message: ProtocolMessage, conn: &mut ConnectionManager) {
        let Some(name) = message.channel.clone() else {
            warn!(action = %message.action, "Channel message without a channel name");
            return;
        };
        match self.all.get_mut(&name) {
            Some(channel) => channel.process_message(message, conn),
            None => warn!(channel = %name, action = %message.action, "Message for unknown channel"),
        }
    }

    pub fn on_transport_active(&mut self, conn: &mut ConnectionManager) {
        for channel in self.all.values_mut() {
            channel.on_transport_active(conn);
        }
    }

    /// Carry a connection interruption into every channel that holds or
    /// is seeking an attachment.
    pub fn propagate_connection_interruption(
        &mut self,
        state: ConnectionState,
        reason: Option<ErrorInfo>,
        conn: &mut ConnectionManager,
    ) {
        let target = match state {
            ConnectionState::Closing | ConnectionState::Closed => ChannelState::Detached,
            ConnectionState::Failed => ChannelState::Failed,
            ConnectionState::Suspended => ChannelState::Suspended,
            _ => return,
        };
        for channel in self.all.values_mut() {
            channel.on_connection_interrupted(target, reason.clone(), conn);
        }
    }

    /// Serial of every channel that has one, for a recovery key.
    pub fn channel_serials(&self) -> BTreeMap<String, String> {
        self.all
            .values()
            .filter_map(|channel| {
                channel
                    .properties
                    .channel_serial
                    .clone()
                    .map(|serial| (channel.name.clone(), serial))
            })
            .collect()
    }

    /// Create channels named in a recovery key, primed with their serials.
    pub fn recover_channels(&mut self, serials: BTreeMap<String, String>) {
        for (name, serial) in serials {
            let channel = self.get_or_create(&name, ChannelOptions::default(), None);
            channel.properties.channel_serial = Some(serial);
        }
    }

    pub fn on_timer(&mut self, fired: TimerFired, conn: &mut ConnectionManager) {
        match &fired.owner {
            TimerOwner::ChannelState(name) => {
                if let Some(channel) = self.all.get_mut(name) {
                    channel.on_state_timer(fired.generation, conn);
                }
            }
            TimerOwner::ChannelRetry(name) => {
                if let Some(channel) = self.all.get_mut(name) {
                    channel.on_retry_timer(fired.generation, conn);
                }
            }
            other => debug!(owner = ?other, "Timer is not a channel timer"),
        }
    }
}
