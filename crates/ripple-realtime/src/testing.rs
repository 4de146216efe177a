//! Test doubles: a scripted transport factory and a harness that drives the
//! engine one input at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ripple_common::EventBus;
use ripple_config::ClientOptions;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::auth::{AuthProvider, StaticAuth};
use crate::channel::{ChannelBuses, ChannelOptions, ChannelState, ChannelStateChange};
use crate::codec::JsonCodec;
use crate::connection::{ConnectionState, ConnectionStateChange};
use crate::engine::{ChannelOp, Command, Engine, Input};
use crate::error::ErrorInfo;
use crate::protocol::{Action, ConnectionDetails, Message, PresenceMessage, ProtocolMessage};
use crate::transport::{
    Transport, TransportEvent, TransportFactory, TransportFailure, TransportParams,
    TransportRegistry, TransportSink,
};

// ---------------------------------------------------------------------------
// Scripted Transports
// ---------------------------------------------------------------------------

pub(crate) enum Outcome {
    Accept,
    Fail(TransportFailure),
}

/// The test's view of one opened transport.
#[derive(Clone)]
pub(crate) struct MockLink {
    pub sink: TransportSink,
    pub params: TransportParams,
    sent: Arc<Mutex<Vec<ProtocolMessage>>>,
    disposed: Arc<AtomicBool>,
}

impl MockLink {
    pub fn sent(&self) -> Vec<ProtocolMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_actions(&self) -> Vec<Action> {
        self.sent().iter().map(|m| m.action).collect()
    }

    pub fn sent_with(&self, action: Action) -> Vec<ProtocolMessage> {
        self.sent().into_iter().filter(|m| m.action == action).collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Deliver a message as if from the server.
    pub fn server_send(&self, message: ProtocolMessage) {
        self.sink.emit(TransportEvent::Message(message));
    }

    pub fn drop_link(&self, error: Option<ErrorInfo>) {
        self.sink.emit(TransportEvent::Disconnected(error));
    }
}

struct MockTransport {
    kind: String,
    link: MockLink,
}

impl Transport for MockTransport {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn send(&mut self, message: &ProtocolMessage) -> Result<(), ErrorInfo> {
        self.link.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn disconnect(&mut self, error: Option<ErrorInfo>) {
        self.link.sink.emit(TransportEvent::Disconnected(error));
    }

    fn close(&mut self) {
        self.link
            .sent
            .lock()
            .unwrap()
            .push(ProtocolMessage::new(Action::Close));
    }

    fn dispose(&mut self) {
        self.link.disposed.store(true, Ordering::SeqCst);
    }
}

/// Opens [`MockTransport`]s, succeeding or failing as scripted. Once the
/// script runs out every attempt is accepted.
pub(crate) struct ScriptedFactory {
    kind: String,
    script: Mutex<VecDeque<Outcome>>,
    links: Mutex<Vec<MockLink>>,
}

impl ScriptedFactory {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            script: Mutex::new(VecDeque::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn links(&self) -> Vec<MockLink> {
        self.links.lock().unwrap().clone()
    }

    pub fn last_link(&self) -> MockLink {
        self.links().pop().expect("no transport opened")
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn try_connect(
        &self,
        params: TransportParams,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, TransportFailure> {
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Accept);
        match outcome {
            Outcome::Accept => {
                let link = MockLink {
                    sink,
                    params,
                    sent: Arc::new(Mutex::new(Vec::new())),
                    disposed: Arc::new(AtomicBool::new(false)),
                };
                self.links.lock().unwrap().push(link.clone());
                Ok(Box::new(MockTransport {
                    kind: self.kind.clone(),
                    link,
                }))
            }
            Outcome::Fail(failure) => Err(failure),
        }
    }
}

// ---------------------------------------------------------------------------
// Server Messages
// ---------------------------------------------------------------------------

pub(crate) fn connected(connection_id: &str, key: &str) -> ProtocolMessage {
    let mut message = ProtocolMessage::new(Action::Connected);
    message.connection_id = Some(connection_id.to_string());
    message.connection_details = Some(ConnectionDetails {
        connection_key: Some(key.to_string()),
        max_idle_interval: Some(0),
        ..Default::default()
    });
    message
}

pub(crate) fn ack(msg_serial: u64, count: u64) -> ProtocolMessage {
    let mut message = ProtocolMessage::new(Action::Ack);
    message.msg_serial = Some(msg_serial);
    message.count = Some(count);
    message
}

pub(crate) fn nack(msg_serial: u64, count: u64, error: Option<ErrorInfo>) -> ProtocolMessage {
    let mut message = ProtocolMessage::new(Action::Nack);
    message.msg_serial = Some(msg_serial);
    message.count = Some(count);
    message.error = error;
    message
}

pub(crate) fn attached(channel: &str, serial: &str, flags: u32) -> ProtocolMessage {
    let mut message = ProtocolMessage::for_channel(Action::Attached, channel);
    message.channel_serial = Some(serial.to_string());
    if flags != 0 {
        message.flags = Some(flags);
    }
    message
}

pub(crate) fn detached(channel: &str, error: Option<ErrorInfo>) -> ProtocolMessage {
    let mut message = ProtocolMessage::for_channel(Action::Detached, channel);
    message.error = error;
    message
}

pub(crate) fn channel_messages(
    channel: &str,
    id: &str,
    serial: &str,
    messages: Vec<Message>,
) -> ProtocolMessage {
    let mut message = ProtocolMessage::for_channel(Action::Message, channel);
    message.id = Some(id.to_string());
    message.channel_serial = Some(serial.to_string());
    message.messages = Some(messages);
    message
}

pub(crate) fn presence(
    channel: &str,
    action: Action,
    serial: Option<&str>,
    members: Vec<PresenceMessage>,
) -> ProtocolMessage {
    let mut message = ProtocolMessage::for_channel(action, channel);
    message.channel_serial = serial.map(str::to_string);
    message.presence = Some(members);
    message
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// An engine driven by hand: inputs are handled only when the test pumps.
pub(crate) struct Harness {
    pub engine: Engine,
    pub factory: Arc<ScriptedFactory>,
    pub state: watch::Receiver<ConnectionState>,
    pub changes: broadcast::Receiver<ConnectionStateChange>,
    rx: mpsc::UnboundedReceiver<Input>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(test_options())
    }

    pub fn with_options(options: ClientOptions) -> Self {
        let factory = Arc::new(ScriptedFactory::new("web_socket"));
        Self::build(options, vec![factory], Arc::new(StaticAuth::key("app.key:secret")))
    }

    /// `factories[0]` is the one [`Harness::connect`] talks to.
    pub fn build(
        options: ClientOptions,
        factories: Vec<Arc<ScriptedFactory>>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let factory = factories[0].clone();
        let registry = factories
            .into_iter()
            .fold(TransportRegistry::new(), |registry, f| registry.with(f));
        let (inbox, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Initialized);
        let events = EventBus::new(256);
        let changes = events.subscribe();
        let engine = Engine::new(
            options,
            registry,
            auth,
            Arc::new(JsonCodec),
            inbox,
            state_tx,
            events,
        );
        Self {
            engine,
            factory,
            state,
            changes,
            rx,
        }
    }

    pub fn conn_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Let spawned work run and handle everything it posted.
    pub async fn pump(&mut self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
            while let Ok(input) = self.rx.try_recv() {
                self.engine.handle(input);
            }
        }
    }

    /// Advance paused time and handle the timers that fired.
    pub async fn advance(&mut self, by: Duration) {
        tokio::time::advance(by).await;
        self.pump().await;
    }

    pub async fn command(&mut self, command: Command) {
        self.engine.handle(Input::Command(command));
        self.pump().await;
    }

    /// Connect and activate the first transport as `conn-1`.
    pub async fn connect(&mut self) -> MockLink {
        self.command(Command::Connect).await;
        let link = self.factory.last_link();
        link.server_send(connected("conn-1", "key-1"));
        self.pump().await;
        assert_eq!(self.conn_state(), ConnectionState::Connected);
        link
    }

    /// Drain connection state changes seen so far.
    pub fn take_changes(&mut self) -> Vec<ConnectionStateChange> {
        let mut changes = Vec::new();
        while let Ok(change) = self.changes.try_recv() {
            changes.push(change);
        }
        changes
    }

    // -- Channels --------------------------------------------------------------

    pub async fn create_channel(&mut self, name: &str, options: ChannelOptions) -> TestChannel {
        let buses = ChannelBuses::new();
        let channel = TestChannel {
            state: buses.state.subscribe(),
            changes: buses.states.subscribe(),
            messages: buses.messages.subscribe(),
            presence: buses.presence.subscribe(),
        };
        self.command(Command::CreateChannel {
            name: name.to_string(),
            options,
            buses,
        })
        .await;
        channel
    }

    /// Post a channel operation; the reply resolves once the engine answers.
    pub async fn channel_op<T>(
        &mut self,
        name: &str,
        op: impl FnOnce(oneshot::Sender<T>) -> ChannelOp,
    ) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Channel {
            name: name.to_string(),
            op: op(tx),
        })
        .await;
        rx
    }

    /// Create `name`, attach it over `link`, and return its observers.
    pub async fn attach(&mut self, link: &MockLink, name: &str) -> TestChannel {
        let channel = self.create_channel(name, ChannelOptions::default()).await;
        let mut reply = self.channel_op(name, ChannelOp::Attach).await;
        link.server_send(attached(name, "serial-0", 0));
        self.pump().await;
        assert_eq!(reply.try_recv().unwrap(), Ok(()));
        channel
    }
}

/// Observers of one channel, as a handle would hold them.
pub(crate) struct TestChannel {
    pub state: watch::Receiver<ChannelState>,
    pub changes: broadcast::Receiver<ChannelStateChange>,
    pub messages: broadcast::Receiver<Message>,
    pub presence: broadcast::Receiver<PresenceMessage>,
}

impl TestChannel {
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn take_changes(&mut self) -> Vec<ChannelStateChange> {
        let mut changes = Vec::new();
        while let Ok(change) = self.changes.try_recv() {
            changes.push(change);
        }
        changes
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub fn take_presence(&mut self) -> Vec<PresenceMessage> {
        let mut events = Vec::new();
        while let Ok(event) = self.presence.try_recv() {
            events.push(event);
        }
        events
    }
}

pub(crate) fn test_options() -> ClientOptions {
    ClientOptions {
        auto_connect: false,
        ..ClientOptions::default()
    }
}
