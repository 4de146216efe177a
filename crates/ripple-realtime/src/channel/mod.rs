//! Channels: per-channel attach state machines and their collection.

mod channels;
mod options;
mod realtime_channel;
mod state;


pub(crate) use channels::Channels;
pub use options::{ChannelMode, ChannelOptions};
pub use realtime_channel::ChannelProperties;
pub(crate) use realtime_channel::{reply_callback, ChannelBuses, RealtimeChannel, Reply};
pub use state::{ChannelEvent, ChannelState, ChannelStateChange};
