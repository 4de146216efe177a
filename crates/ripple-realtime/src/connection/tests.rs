use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ripple_config::ClientOptions;
use serde_json::json;
use tokio::sync::oneshot;

use super::*;
use crate::auth::{AuthParams, AuthProvider, StaticAuth};
use crate::engine::Command;
use crate::error::{codes, ErrorInfo};
use crate::protocol::{Action, ConnectionDetails, Message, ProtocolMessage};
use crate::testing::{ack, connected, nack, test_options, Harness, Outcome, ScriptedFactory};
use crate::transport::{ConnectMode, TransportFailure};

fn completion() -> (SendCallback, oneshot::Receiver<Result<(), ErrorInfo>>) {
    let (tx, rx) = oneshot::channel();
    let callback: SendCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, rx)
}

fn publish_to(channel: &str, text: &str) -> ProtocolMessage {
    let mut message = ProtocolMessage::for_channel(Action::Message, channel);
    message.messages = Some(vec![Message::new("greeting", json!(text))]);
    message
}

fn states(changes: &[ConnectionStateChange]) -> Vec<ConnectionState> {
    changes.iter().map(|c| c.current).collect()
}

// ---------------------------------------------------------------------------
// Connecting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_reaches_connected_through_connecting() {
    let mut h = Harness::new();
    let link = h.connect().await;

    assert_eq!(
        states(&h.take_changes()),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert_eq!(link.params.mode, ConnectMode::Clean);
    assert_eq!(h.engine.conn.connection_id(), Some("conn-1"));
    assert!(h.engine.conn.error_reason().is_none());
}

#[tokio::test]
async fn first_transport_to_connect_wins_the_race() {
    let ws = Arc::new(ScriptedFactory::new("web_socket"));
    let xhr = Arc::new(ScriptedFactory::new("xhr_polling"));
    let options = ClientOptions {
        transports: vec!["web_socket".into(), "xhr_polling".into()],
        ..test_options()
    };
    let mut h = Harness::build(
        options,
        vec![ws.clone(), xhr.clone()],
        Arc::new(StaticAuth::key("app.key:secret")),
    );

    h.command(Command::Connect).await;
    let (ws_link, xhr_link) = (ws.last_link(), xhr.last_link());
    xhr_link.server_send(connected("conn-xhr", "key-xhr"));
    h.pump().await;

    assert_eq!(h.conn_state(), ConnectionState::Connected);
    assert!(ws_link.is_disposed());
    assert!(!xhr_link.is_disposed());

    // The loser's late CONNECTED changes nothing.
    ws_link.server_send(connected("conn-ws", "key-ws"));
    h.pump().await;
    assert_eq!(h.engine.conn.connection_id(), Some("conn-xhr"));
}

#[tokio::test]
async fn no_registered_candidate_fails_the_connection() {
    let options = ClientOptions {
        transports: vec!["xhr_polling".into()],
        ..test_options()
    };
    let mut h = Harness::with_options(options);
    h.command(Command::Connect).await;

    assert_eq!(h.conn_state(), ConnectionState::Failed);
    assert_eq!(
        h.engine.conn.error_reason().map(|e| e.code),
        Some(codes::CONNECTION_FAILED)
    );
}

struct RecordingAuth {
    forced: Mutex<Vec<bool>>,
}

#[async_trait]
impl AuthProvider for RecordingAuth {
    async fn auth_params(&self, force_new_token: bool) -> Result<AuthParams, ErrorInfo> {
        let mut forced = self.forced.lock().unwrap();
        forced.push(force_new_token);
        Ok(AuthParams::new().with("access_token", format!("tok-{}", forced.len())))
    }
}

#[tokio::test]
async fn token_error_retries_once_with_a_fresh_token() {
    let factory = Arc::new(ScriptedFactory::new("web_socket"));
    factory.script(Outcome::Fail(TransportFailure::Disconnected(ErrorInfo::new(
        40142,
        401,
        "Token expired",
    ))));
    let auth = Arc::new(RecordingAuth {
        forced: Mutex::new(Vec::new()),
    });
    let mut h = Harness::build(test_options(), vec![factory.clone()], auth.clone());

    h.command(Command::Connect).await;
    let link = factory.last_link();
    assert_eq!(link.params.auth.access_token(), Some("tok-2"));
    link.server_send(connected("conn-1", "key-1"));
    h.pump().await;

    assert_eq!(h.conn_state(), ConnectionState::Connected);
    assert_eq!(*auth.forced.lock().unwrap(), vec![false, true]);
    assert!(h.engine.conn.error_reason().is_none());
}

#[tokio::test]
async fn server_auth_request_sends_a_fresh_token() {
    let factory = Arc::new(ScriptedFactory::new("web_socket"));
    let auth = Arc::new(RecordingAuth {
        forced: Mutex::new(Vec::new()),
    });
    let mut h = Harness::build(test_options(), vec![factory.clone()], auth.clone());

    h.command(Command::Connect).await;
    let link = factory.last_link();
    link.server_send(connected("conn-1", "key-1"));
    h.pump().await;

    link.server_send(ProtocolMessage::new(Action::Auth));
    h.pump().await;

    let sent = link.sent_with(Action::Auth);
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].auth.as_ref().map(|a| a.access_token.as_str()),
        Some("tok-2")
    );
    assert_eq!(*auth.forced.lock().unwrap(), vec![false, true]);
    assert_eq!(h.conn_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn unresolvable_disconnected_fails_the_connection() {
    let mut h = Harness::new();
    let link = h.connect().await;

    let mut message = ProtocolMessage::new(Action::Disconnected);
    message.error = Some(ErrorInfo::new(codes::BAD_REQUEST, 400, "Bad request"));
    link.server_send(message);
    h.pump().await;

    assert_eq!(h.conn_state(), ConnectionState::Failed);
}

#[tokio::test]
async fn client_id_mismatch_fails_the_connection() {
    let options = ClientOptions {
        client_id: Some("alice".into()),
        ..test_options()
    };
    let mut h = Harness::with_options(options);
    h.command(Command::Connect).await;

    let mut message = connected("conn-1", "key-1");
    message.connection_details = Some(ConnectionDetails {
        client_id: Some("bob".into()),
        connection_key: Some("key-1".into()),
        ..Default::default()
    });
    h.factory.last_link().server_send(message);
    h.pump().await;

    assert_eq!(h.conn_state(), ConnectionState::Failed);
    assert_eq!(
        h.engine.conn.error_reason().map(|e| e.code),
        Some(codes::INCOMPATIBLE_CLIENT_ID)
    );
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_messages_get_serials_when_sent() {
    let mut h = Harness::new();
    let (first, mut first_rx) = completion();
    let (second, _second_rx) = completion();
    h.engine.conn.send(publish_to("a", "one"), true, vec![first]);
    h.engine.conn.send(publish_to("b", "two"), true, vec![second]);

    let link = h.connect().await;
    let sent = link.sent_with(Action::Message);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].msg_serial, Some(0));
    assert_eq!(sent[0].channel.as_deref(), Some("a"));
    assert_eq!(sent[1].msg_serial, Some(1));
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn queued_messages_for_one_channel_are_bundled() {
    let mut h = Harness::new();
    let (first, mut first_rx) = completion();
    let (second, mut second_rx) = completion();
    h.engine.conn.send(publish_to("a", "one"), true, vec![first]);
    h.engine.conn.send(publish_to("a", "two"), true, vec![second]);

    let link = h.connect().await;
    let sent = link.sent_with(Action::Message);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].messages.as_ref().map(Vec::len), Some(2));

    link.server_send(ack(0, 1));
    h.pump().await;
    assert_eq!(first_rx.try_recv().unwrap(), Ok(()));
    assert_eq!(second_rx.try_recv().unwrap(), Ok(()));
}

#[tokio::test]
async fn unqueueable_message_is_rejected_before_connect() {
    let mut h = Harness::new();
    let (callback, mut rx) = completion();
    h.engine.conn.send(publish_to("a", "one"), false, vec![callback]);

    let err = rx.try_recv().unwrap().unwrap_err();
    assert_eq!(err.code, codes::CHANNEL_OPERATION_FAILED);
    assert!(err.message.contains("queueEvent was false"));
}

#[tokio::test]
async fn acks_and_nacks_complete_in_serial_order() {
    let mut h = Harness::new();
    let link = h.connect().await;

    let mut receivers = Vec::new();
    for text in ["one", "two", "three"] {
        let (callback, rx) = completion();
        h.engine.conn.send(publish_to("a", text), true, vec![callback]);
        receivers.push(rx);
    }
    let serials: Vec<_> = link
        .sent_with(Action::Message)
        .iter()
        .map(|m| m.msg_serial)
        .collect();
    assert_eq!(serials, vec![Some(0), Some(1), Some(2)]);

    let (idle_tx, mut idle_rx) = oneshot::channel();
    h.command(Command::WhenIdle(idle_tx)).await;
    assert!(idle_rx.try_recv().is_err());

    link.server_send(ack(0, 2));
    h.pump().await;
    assert_eq!(receivers[0].try_recv().unwrap(), Ok(()));
    assert_eq!(receivers[1].try_recv().unwrap(), Ok(()));
    assert!(receivers[2].try_recv().is_err());

    link.server_send(nack(2, 1, Some(ErrorInfo::new(40160, 401, "Not permitted"))));
    h.pump().await;
    assert_eq!(receivers[2].try_recv().unwrap().unwrap_err().code, 40160);
    assert_eq!(idle_rx.try_recv(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn in_flight_messages_survive_a_transport_drop() {
    let mut h = Harness::new();
    let link = h.connect().await;
    let mut receivers = Vec::new();
    for channel in ["a", "b", "c"] {
        let (callback, rx) = completion();
        h.engine.conn.send(publish_to(channel, "one"), true, vec![callback]);
        receivers.push(rx);
    }
    assert_eq!(link.sent_with(Action::Message).len(), 3);
    h.take_changes();

    link.drop_link(None);
    h.pump().await;
    let changes = h.take_changes();
    assert_eq!(states(&changes), vec![ConnectionState::Disconnected]);
    assert_eq!(changes[0].retry_in, Some(Duration::ZERO));

    let (callback, rx) = completion();
    h.engine.conn.send(publish_to("d", "later"), true, vec![callback]);
    receivers.push(rx);

    h.advance(Duration::from_millis(5)).await;
    let resumed = h.factory.last_link();
    assert_eq!(resumed.params.mode, ConnectMode::Resume);
    assert_eq!(resumed.params.connection_key.as_deref(), Some("key-1"));

    resumed.server_send(connected("conn-1", "key-2"));
    h.pump().await;
    assert_eq!(h.conn_state(), ConnectionState::Connected);
    let resent: Vec<_> = resumed
        .sent_with(Action::Message)
        .into_iter()
        .map(|m| (m.msg_serial, m.channel))
        .collect();
    assert_eq!(
        resent,
        vec![
            (Some(0), Some("a".to_string())),
            (Some(1), Some("b".to_string())),
            (Some(2), Some("c".to_string())),
            (Some(3), Some("d".to_string())),
        ]
    );
    assert!(receivers.iter_mut().all(|rx| rx.try_recv().is_err()));

    resumed.server_send(ack(0, 4));
    h.pump().await;
    for mut rx in receivers {
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }
}

#[tokio::test(start_paused = true)]
async fn new_connection_id_resets_serials() {
    let mut h = Harness::new();
    let link = h.connect().await;
    let (callback, _rx) = completion();
    h.engine.conn.send(publish_to("a", "one"), true, vec![callback]);

    link.drop_link(None);
    h.pump().await;
    h.advance(Duration::from_millis(5)).await;
    let fresh = h.factory.last_link();
    fresh.server_send(connected("conn-2", "key-2"));
    h.pump().await;

    let resent = fresh.sent_with(Action::Message);
    assert_eq!(resent[0].msg_serial, Some(0));
    let (callback, _rx) = completion();
    h.engine.conn.send(publish_to("a", "two"), true, vec![callback]);
    assert_eq!(fresh.sent_with(Action::Message)[1].msg_serial, Some(1));
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unreachable_server_ends_in_suspended() {
    let mut h = Harness::new();
    let (callback, mut rx) = completion();
    h.engine.conn.send(publish_to("a", "one"), true, vec![callback]);
    h.command(Command::Connect).await;

    for _ in 0..125 {
        h.advance(Duration::from_secs(1)).await;
    }

    assert_eq!(h.conn_state(), ConnectionState::Suspended);
    let seen = states(&h.take_changes());
    assert!(seen.contains(&ConnectionState::Disconnected));
    assert_eq!(seen.last(), Some(&ConnectionState::Suspended));
    assert_eq!(
        rx.try_recv().unwrap().unwrap_err().code,
        codes::CONNECTION_SUSPENDED
    );
}

#[tokio::test(start_paused = true)]
async fn ping_resolves_on_matching_heartbeat() {
    let mut h = Harness::new();
    let link = h.connect().await;
    let (tx, mut rx) = oneshot::channel();
    h.command(Command::Ping(tx)).await;

    let heartbeat = link.sent_with(Action::Heartbeat).remove(0);
    assert!(heartbeat.id.is_some());
    h.advance(Duration::from_millis(40)).await;
    link.server_send(heartbeat);
    h.pump().await;

    let rtt = rx.try_recv().unwrap().unwrap();
    assert!(rtt >= Duration::from_millis(40));
}

#[tokio::test(start_paused = true)]
async fn ping_times_out_without_a_heartbeat() {
    let mut h = Harness::new();
    h.connect().await;
    let (tx, mut rx) = oneshot::channel();
    h.command(Command::Ping(tx)).await;

    h.advance(Duration::from_millis(10_001)).await;
    assert_eq!(rx.try_recv().unwrap().unwrap_err().code, codes::INTERNAL);
}

#[tokio::test]
async fn ping_needs_a_connection() {
    let mut h = Harness::new();
    let (tx, mut rx) = oneshot::channel();
    h.command(Command::Ping(tx)).await;
    assert_eq!(rx.try_recv().unwrap().unwrap_err().code, codes::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn silent_transport_is_dropped_as_idle() {
    let mut h = Harness::new();
    h.command(Command::Connect).await;
    let mut message = connected("conn-1", "key-1");
    if let Some(details) = message.connection_details.as_mut() {
        details.max_idle_interval = Some(5_000);
    }
    h.factory.last_link().server_send(message);
    h.pump().await;
    h.take_changes();

    h.advance(Duration::from_secs(14)).await;
    assert_eq!(h.conn_state(), ConnectionState::Connected);

    h.advance(Duration::from_secs(2)).await;
    let dropped = h
        .take_changes()
        .into_iter()
        .find(|c| c.current == ConnectionState::Disconnected)
        .expect("idle transport should disconnect");
    assert_eq!(
        dropped.reason.map(|r| r.code),
        Some(codes::CONNECTION_DISCONNECTED)
    );
}

// ---------------------------------------------------------------------------
// Closing / Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_waits_for_closed() {
    let mut h = Harness::new();
    let link = h.connect().await;

    h.command(Command::Close).await;
    assert_eq!(h.conn_state(), ConnectionState::Closing);
    assert!(link.sent_actions().contains(&Action::Close));

    link.server_send(ProtocolMessage::new(Action::Closed));
    h.pump().await;
    assert_eq!(h.conn_state(), ConnectionState::Closed);
    assert!(h.engine.conn.connection_id().is_none());
}

#[tokio::test]
async fn close_before_connect_closes_immediately() {
    let mut h = Harness::new();
    h.command(Command::Close).await;
    assert_eq!(
        states(&h.take_changes()),
        vec![ConnectionState::Closing, ConnectionState::Closed]
    );
}

#[tokio::test]
async fn recovery_key_resumes_in_a_new_client() {
    let mut h = Harness::new();
    h.connect().await;
    let (tx, mut rx) = oneshot::channel();
    h.command(Command::RecoveryKey(tx)).await;
    let key = rx.try_recv().unwrap().expect("connected client has a key");

    let context = RecoveryContext::decode(&key).unwrap();
    assert_eq!(context.connection_key, "key-1");
    assert_eq!(context.msg_serial, 0);

    let options = ClientOptions {
        recover: Some(key),
        ..test_options()
    };
    let mut recovered = Harness::with_options(options);
    recovered.command(Command::Connect).await;
    let link = recovered.factory.last_link();
    assert_eq!(link.params.mode, ConnectMode::Recover);
    assert_eq!(link.params.connection_key.as_deref(), Some("key-1"));
}

#[tokio::test]
async fn recovery_key_is_absent_before_connecting() {
    let mut h = Harness::new();
    let (tx, mut rx) = oneshot::channel();
    h.command(Command::RecoveryKey(tx)).await;
    assert_eq!(rx.try_recv().unwrap(), None);
}
