//! Configuration schema types for the realtime client.
//!
//! All structs use `serde(default)` so partial configs work correctly.

mod endpoint;
mod timeouts;

pub use endpoint::*;
pub use timeouts::*;

use serde::{Deserialize, Serialize};

/// Transport kinds the client knows how to name, in default preference order.
pub const KNOWN_TRANSPORTS: &[&str] = &["web_socket", "xhr_streaming", "xhr_polling", "jsonp"];

/// Root options for a realtime client.
///
/// Captured once at client construction; components keep their own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Identity of this client, attached to presence and published messages.
    pub client_id: Option<String>,
    /// Transport kinds to try, most preferred first.
    pub transports: Vec<String>,
    /// Queue outbound messages while connecting or disconnected.
    pub queue_messages: bool,
    /// Ask the server to echo our own publishes back to us.
    pub echo_messages: bool,
    /// Start connecting as soon as the client is built.
    pub auto_connect: bool,
    /// Recovery key from a previous connection's `create_recovery_key()`.
    pub recover: Option<String>,
    /// Upper bound on a single publish, overridden by the server on connect.
    pub max_message_size: u32,
    pub endpoint: EndpointConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            transports: vec![
                "web_socket".into(),
                "xhr_streaming".into(),
                "xhr_polling".into(),
            ],
            queue_messages: true,
            echo_messages: true,
            auto_connect: true,
            recover: None,
            max_message_size: 65_536,
            endpoint: EndpointConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}
