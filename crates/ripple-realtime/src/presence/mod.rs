//! Channel presence: the member set, this client's own members, and the
//! operations that change them.

mod map;
mod operations;
mod realtime_presence;


pub use map::PresenceQuery;
pub(crate) use realtime_presence::{PresenceReply, RealtimePresence};
