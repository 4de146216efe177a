//! Tests for TOML option loading.

use super::*;
use ripple_common::ConfigError;
use std::path::Path;

#[test]
fn load_from_nonexistent_returns_file_not_found() {
    let result = load_from_path(Path::new("/tmp/nonexistent_ripple_config.toml"));
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn load_valid_partial_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ripple.toml");
    std::fs::write(
        &path,
        r##"
client_id = "alice"
transports = ["web_socket"]

[timeouts]
disconnected_retry_ms = 2000

[endpoint]
host = "localhost"
port = 9000
tls = false
"##,
    )
    .unwrap();

    let options = load_from_path(&path).unwrap();
    assert_eq!(options.client_id.as_deref(), Some("alice"));
    assert_eq!(options.transports, vec!["web_socket".to_string()]);
    assert_eq!(options.timeouts.disconnected_retry_ms, 2000);
    assert_eq!(options.endpoint.ws_url(), "ws://localhost:9000/");
    // Defaults preserved
    assert_eq!(options.timeouts.suspended_retry_ms, 30_000);
    assert!(options.queue_messages);
}

#[test]
fn load_invalid_toml_returns_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ripple.toml");
    std::fs::write(&path, "this is not valid toml {{{").unwrap();

    let result = load_from_path(&path);
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn out_of_range_values_are_rejected() {
    let result = from_toml_str(
        r#"
[timeouts]
realtime_request_ms = 5
"#,
    );
    let err = result.unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
    assert!(err.to_string().contains("timeouts.realtime_request_ms"));
}

#[test]
fn empty_document_yields_defaults() {
    let options = from_toml_str("").unwrap();
    assert_eq!(options.max_message_size, 65_536);
    assert_eq!(options.timeouts.connect().as_millis(), 16_000);
}
