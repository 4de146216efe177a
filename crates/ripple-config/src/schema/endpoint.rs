//! Server endpoint configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "realtime.ripple.dev".into(),
            port: 443,
            tls: true,
            path: "/".into(),
        }
    }
}

impl EndpointConfig {
    /// Base WebSocket URL, without connect parameters.
    pub fn ws_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }
}
