//! Tests for the full validation pipeline.

use super::*;

#[test]
fn default_options_validate() {
    assert!(validate(&ClientOptions::default()).is_ok());
}

#[test]
fn catches_empty_transport_list() {
    let mut options = ClientOptions::default();
    options.transports.clear();
    let err = validate(&options).unwrap_err().to_string();
    assert!(err.contains("at least one transport"));
}

#[test]
fn catches_unknown_transport() {
    let mut options = ClientOptions::default();
    options.transports.push("carrier_pigeon".into());
    let err = validate(&options).unwrap_err().to_string();
    assert!(err.contains("unknown transport 'carrier_pigeon'"));
}

#[test]
fn catches_duplicate_transport() {
    let mut options = ClientOptions::default();
    options.transports = vec!["web_socket".into(), "web_socket".into()];
    let err = validate(&options).unwrap_err().to_string();
    assert!(err.contains("listed more than once"));
}

#[test]
fn catches_wildcard_client_id() {
    let options = ClientOptions {
        client_id: Some("*".into()),
        ..Default::default()
    };
    let err = validate(&options).unwrap_err().to_string();
    assert!(err.contains("client_id '*' is reserved"));
}

#[test]
fn catches_zero_request_timeout() {
    let mut options = ClientOptions::default();
    options.timeouts.realtime_request_ms = 0;
    let err = validate(&options).unwrap_err().to_string();
    assert!(err.contains("timeouts.realtime_request_ms"));
}

#[test]
fn catches_zero_max_message_size() {
    let options = ClientOptions {
        max_message_size: 0,
        ..Default::default()
    };
    let err = validate(&options).unwrap_err().to_string();
    assert!(err.contains("max_message_size"));
}

#[test]
fn collects_every_error() {
    let mut options = ClientOptions::default();
    options.endpoint.host = String::new();
    options.endpoint.port = 0;
    options.timeouts.channel_retry_ms = 0;
    let err = validate(&options).unwrap_err().to_string();
    assert!(err.contains("endpoint.host"));
    assert!(err.contains("endpoint.port"));
    assert!(err.contains("timeouts.channel_retry_ms"));
}
