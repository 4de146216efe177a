//! The connection: one active transport at a time, the canonical connection
//! state, and the outbound queue.

mod connect;
mod manager;
mod pending;
mod protocol;
mod queue;
mod recovery;
mod state;

#[cfg(test)]
mod tests;

pub(crate) use manager::{ConnectionManager, Notice};
pub use pending::SendCallback;
pub use recovery::RecoveryContext;
pub use state::{ConnectionEvent, ConnectionState, ConnectionStateChange};

use crate::transport::TransportId;

/// Why auth parameters were requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AuthPurpose {
    /// Opening transports for a connect attempt.
    Connect,
    /// Retrying one transport after a token error.
    Retry { id: TransportId, kind: String },
    /// The server asked for fresh credentials on the live connection.
    Reauth,
}
