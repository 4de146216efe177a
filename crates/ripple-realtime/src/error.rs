//! Protocol-level errors and their classification.

use serde::{Deserialize, Serialize};

/// Well-known error codes.
pub mod codes {
    pub const BAD_REQUEST: u32 = 40000;
    pub const MAX_MESSAGE_SIZE_EXCEEDED: u32 = 40009;
    pub const CLIENT_ID_REQUIRED: u32 = 40012;
    pub const DELTA_DECODE_FAILED: u32 = 40018;
    pub const VCDIFF_UNSUPPORTED: u32 = 40019;
    pub const DELTA_BASE_UNAVAILABLE: u32 = 40021;
    pub const INCOMPATIBLE_CLIENT_ID: u32 = 40102;
    pub const TOKEN_ERROR_MIN: u32 = 40140;
    pub const TOKEN_ERROR_MAX: u32 = 40150;
    pub const TOKEN_NOT_RENEWABLE: u32 = 40171;
    pub const INTERNAL: u32 = 50000;
    pub const UNKNOWN_CHANNEL: u32 = 50001;
    pub const UNKNOWN_CONNECTION: u32 = 50002;
    pub const CONNECTION_FAILED: u32 = 80000;
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    pub const CONNECTION_DISCONNECTED: u32 = 80003;
    pub const SUPERSEDED_TRANSPORT: u32 = 80016;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const AUTH_FAILED: u32 = 80019;
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
    pub const CHANNEL_INVALID_STATE: u32 = 90001;
    pub const CHANNEL_TIMEOUT: u32 = 90007;
    pub const PRESENCE_REENTER_FAILED: u32 = 91004;
    pub const PRESENCE_OUT_OF_SYNC: u32 = 91005;
}

/// Codes the server uses to describe connection-level state.
const CONNECTION_CODES: &[u32] = &[
    codes::CONNECTION_DISCONNECTED,
    codes::CONNECTION_SUSPENDED,
    codes::CONNECTION_FAILED,
    codes::CONNECTION_CLOSED,
    codes::UNKNOWN_CONNECTION,
    codes::UNKNOWN_CHANNEL,
];

/// An error as carried on the wire and surfaced to callers.
///
/// `code` and `status_code` of `0` mean "not supplied".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{message} (code {code}, status {status_code})")]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn disconnected() -> Self {
        Self::new(
            codes::CONNECTION_DISCONNECTED,
            400,
            "Connection to server temporarily unavailable",
        )
    }

    pub fn suspended() -> Self {
        Self::new(codes::CONNECTION_SUSPENDED, 400, "Connection to server unavailable")
    }

    pub fn failed() -> Self {
        Self::new(
            codes::CONNECTION_FAILED,
            400,
            "Connection failed or disconnected by server",
        )
    }

    pub fn closing() -> Self {
        Self::new(codes::CONNECTION_CLOSED, 400, "Connection closing")
    }

    pub fn closed() -> Self {
        Self::new(codes::CONNECTION_CLOSED, 400, "Connection closed")
    }

    pub fn unknown_connection_error() -> Self {
        Self::new(codes::UNKNOWN_CONNECTION, 500, "Internal connection error")
    }

    pub fn unknown_channel_error() -> Self {
        Self::new(codes::UNKNOWN_CHANNEL, 500, "Internal channel error")
    }

    /// Default reason for a NACK that carries none.
    pub fn nack_default() -> Self {
        Self::new(
            codes::UNKNOWN_CHANNEL,
            500,
            "Unable to send message; channel not responding",
        )
    }

    /// The client task that owns the connection is gone.
    pub fn engine_stopped() -> Self {
        Self::new(codes::UNKNOWN_CONNECTION, 500, "Realtime client has shut down")
    }

    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_MIN..codes::TOKEN_ERROR_MAX).contains(&self.code)
    }

    /// Whether a connect attempt that failed with this error is worth retrying.
    pub fn is_retriable(&self) -> bool {
        self.status_code == 0
            || self.code == 0
            || self.status_code >= 500
            || CONNECTION_CODES.contains(&self.code)
    }

    /// Client errors that no amount of retrying will fix.
    pub fn is_unresolvable(&self) -> bool {
        (400..500).contains(&self.status_code) && !self.is_retriable() && !self.is_token_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_status() {
        let err = ErrorInfo::disconnected();
        assert_eq!(
            err.to_string(),
            "Connection to server temporarily unavailable (code 80003, status 400)"
        );
    }

    #[test]
    fn connection_state_errors_are_retriable() {
        assert!(ErrorInfo::disconnected().is_retriable());
        assert!(ErrorInfo::suspended().is_retriable());
        assert!(ErrorInfo::failed().is_retriable());
        assert!(ErrorInfo::closed().is_retriable());
        assert!(ErrorInfo::new(0, 0, "socket reset").is_retriable());
        assert!(ErrorInfo::new(50300, 503, "unavailable").is_retriable());
    }

    #[test]
    fn client_errors_are_not_retriable() {
        let err = ErrorInfo::new(40160, 401, "capability denied");
        assert!(!err.is_retriable());
        assert!(err.is_unresolvable());
    }

    #[test]
    fn token_errors_are_recoverable_by_reauth() {
        let err = ErrorInfo::new(40142, 401, "token expired");
        assert!(err.is_token_error());
        assert!(!err.is_unresolvable());
        assert!(!ErrorInfo::new(40150, 401, "x").is_token_error());
        assert!(!ErrorInfo::new(40139, 401, "x").is_token_error());
    }

    #[test]
    fn deserializes_wire_shape() {
        let json = r#"{"code":40012,"statusCode":400,"message":"clientId required"}"#;
        let err: ErrorInfo = serde_json::from_str(json).unwrap();
        assert_eq!(err.code, codes::CLIENT_ID_REQUIRED);
        assert_eq!(err.status_code, 400);
        assert!(err.cause.is_none());
    }
}
