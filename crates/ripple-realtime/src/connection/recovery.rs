//! Recovery keys: enough state to continue a connection from a new client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    pub connection_key: String,
    pub msg_serial: u64,
    #[serde(default)]
    pub channel_serials: BTreeMap<String, String>,
}

impl RecoveryContext {
    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Malformed keys are logged and ignored so the client connects clean.
    pub fn decode(key: &str) -> Option<Self> {
        match serde_json::from_str(key) {
            Ok(context) => Some(context),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed recovery key");
                None
            }
        }
    }
}
