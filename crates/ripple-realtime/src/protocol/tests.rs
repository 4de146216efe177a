use super::*;
use serde_json::json;

#[test]
fn action_codes_match_wire_values() {
    assert_eq!(Action::Heartbeat.code(), 0);
    assert_eq!(Action::Connected.code(), 4);
    assert_eq!(Action::Attach.code(), 10);
    assert_eq!(Action::Sync.code(), 16);
    assert_eq!(Action::Activate.code(), 18);
    assert_eq!(Action::from(15), Action::Message);
}

#[test]
fn unknown_action_survives_decoding() {
    let msg: ProtocolMessage = serde_json::from_str(r#"{"action":42,"channel":"a"}"#).unwrap();
    assert_eq!(msg.action, Action::Unknown(42));
    assert_eq!(msg.action.to_string(), "UNKNOWN(42)");
    assert_eq!(msg.channel.as_deref(), Some("a"));
}

#[test]
fn only_user_data_requires_ack() {
    assert!(Action::Message.is_ack_required());
    assert!(Action::Presence.is_ack_required());
    assert!(!Action::Attach.is_ack_required());
    assert!(!Action::Heartbeat.is_ack_required());
}

#[test]
fn serializes_camel_case_and_skips_empty_fields() {
    let mut msg = ProtocolMessage::for_channel(Action::Attach, "room");
    msg.channel_serial = Some("abc".into());
    msg.set_flag(flags::ATTACH_RESUME);
    let json = serde_json::to_value(&msg).unwrap();
    assert_eq!(
        json,
        json!({"action": 10, "channel": "room", "channelSerial": "abc", "flags": 32})
    );
}

#[test]
fn decodes_connected_with_details() {
    let text = r#"{
        "action": 4,
        "connectionId": "conn-1",
        "connectionDetails": {
            "connectionKey": "key-1",
            "maxMessageSize": 1024,
            "connectionStateTtl": 60000,
            "maxIdleInterval": 15000,
            "clientId": "alice"
        }
    }"#;
    let msg: ProtocolMessage = serde_json::from_str(text).unwrap();
    let details = msg.connection_details.unwrap();
    assert_eq!(msg.connection_id.as_deref(), Some("conn-1"));
    assert_eq!(details.connection_key.as_deref(), Some("key-1"));
    assert_eq!(details.max_message_size, Some(1024));
    assert_eq!(details.max_idle_interval, Some(15000));
}

#[test]
fn flags_are_tested_by_bit() {
    let mut msg = ProtocolMessage::new(Action::Attached);
    assert!(!msg.has_flag(flags::RESUMED));
    msg.flags = Some(flags::RESUMED | flags::HAS_PRESENCE | flags::PUBLISH);
    assert!(msg.has_flag(flags::RESUMED));
    assert!(msg.has_flag(flags::HAS_PRESENCE));
    assert!(!msg.has_flag(flags::HAS_BACKLOG));
    assert_eq!(msg.modes(), flags::PUBLISH);
}

#[test]
fn presence_action_travels_as_integer() {
    let json = r#"{"action":2,"clientId":"bob","connectionId":"c1","id":"c1:0:0"}"#;
    let presence: PresenceMessage = serde_json::from_str(json).unwrap();
    assert_eq!(presence.action, PresenceAction::Enter);
    assert!(serde_json::from_str::<PresenceMessage>(r#"{"action":9}"#).is_err());
}

#[test]
fn presence_id_parsing() {
    let mut presence = PresenceMessage::new(PresenceAction::Enter, "bob");
    presence.connection_id = "conn:x".into();
    presence.id = Some("conn:x:12:3".into());
    assert!(!presence.is_synthesized());
    assert_eq!(
        presence.parse_id(),
        Some(PresenceId {
            msg_serial: 12,
            index: 3
        })
    );

    presence.id = Some("other:1:0".into());
    assert!(presence.is_synthesized());

    presence.id = Some("garbage".into());
    assert_eq!(presence.parse_id(), None);
}

#[test]
fn message_size_counts_name_data_and_client() {
    let mut msg = Message::new("greeting", json!("hello"));
    assert_eq!(msg.size(), 8 + 5);
    msg.client_id = Some("ab".into());
    msg.data = Some(json!({"k": 1}));
    assert_eq!(msg.size(), 8 + 2 + r#"{"k":1}"#.len());
}

#[test]
fn delta_base_reads_extras() {
    let mut msg = Message::new("n", json!("d"));
    assert_eq!(msg.delta_base(), None);
    msg.extras = Some(json!({"delta": {"from": "m1", "format": "vcdiff"}}));
    assert_eq!(msg.delta_base(), Some("m1"));
}
