//! Wire types: the protocol envelope, its actions and flags, and the user
//! payloads it carries.

mod action;
mod message;
mod payload;

#[cfg(test)]
mod tests;

pub use action::Action;
pub use message::{flags, AuthDetails, ConnectionDetails, ProtocolMessage};
pub use payload::{Message, PresenceAction, PresenceId, PresenceMessage};
