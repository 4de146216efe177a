//! The application-facing client.
//!
//! [`RealtimeClient`] and its handles are cheap to clone and never touch
//! connection or channel state directly; every call becomes a command on the
//! engine inbox and, where there is an outcome, awaits a reply.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ripple_common::{EventBus, RippleError};
use ripple_config::{load_from_path, validation, ClientOptions};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::auth::AuthProvider;
use crate::channel::{
    ChannelBuses, ChannelOptions, ChannelProperties, ChannelState, ChannelStateChange,
};
use crate::codec::{JsonCodec, MessageCodec};
use crate::connection::{ConnectionState, ConnectionStateChange};
use crate::engine::{ChannelOp, Command, Engine, Input};
use crate::error::ErrorInfo;
use crate::presence::PresenceQuery;
use crate::protocol::{Message, PresenceAction, PresenceMessage};
use crate::transport::TransportRegistry;

type Inbox = mpsc::UnboundedSender<Input>;

fn post(inbox: &Inbox, command: Command) -> Result<(), ErrorInfo> {
    inbox
        .send(Input::Command(command))
        .map_err(|_| ErrorInfo::engine_stopped())
}

/// Post a command carrying a reply channel and wait for the reply.
async fn request<T>(
    inbox: &Inbox,
    command: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T, ErrorInfo> {
    let (tx, rx) = oneshot::channel();
    post(inbox, command(tx))?;
    rx.await.map_err(|_| ErrorInfo::engine_stopped())
}

struct Shared {
    inbox: Inbox,
    state: watch::Receiver<ConnectionState>,
    events: EventBus<ConnectionStateChange>,
    channels: Mutex<HashMap<String, ChannelHandle>>,
    options: ClientOptions,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.inbox.send(Input::Command(Command::Shutdown));
    }
}

// ---------------------------------------------------------------------------
// RealtimeClient
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl RealtimeClient {
    /// Start a client. Must be called from within a Tokio runtime; the
    /// engine runs until the last clone of the client is dropped.
    pub fn new(
        options: ClientOptions,
        registry: TransportRegistry,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, RippleError> {
        Self::with_codec(options, registry, auth, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        options: ClientOptions,
        registry: TransportRegistry,
        auth: Arc<dyn AuthProvider>,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self, RippleError> {
        validation::validate(&options)?;

        let (inbox, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initialized);
        let events = EventBus::new(64);
        let engine = Engine::new(
            options.clone(),
            registry,
            auth,
            codec,
            inbox.clone(),
            state_tx,
            events.clone(),
        );
        tokio::spawn(engine.run(rx));
        info!(transports = ?options.transports, auto_connect = options.auto_connect, "Realtime client started");

        if options.auto_connect {
            post(&inbox, Command::Connect).map_err(|e| RippleError::Engine(e.to_string()))?;
        }
        Ok(Self {
            shared: Arc::new(Shared {
                inbox,
                state: state_rx,
                events,
                channels: Mutex::new(HashMap::new()),
                options,
            }),
        })
    }

    /// Start a client from a TOML config file.
    pub fn from_config_path(
        path: &Path,
        registry: TransportRegistry,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, RippleError> {
        let options = load_from_path(path)?;
        Self::new(options, registry, auth)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    // -- Connection ----------------------------------------------------------

    pub fn connect(&self) -> Result<(), ErrorInfo> {
        post(&self.shared.inbox, Command::Connect)
    }

    pub fn close(&self) -> Result<(), ErrorInfo> {
        post(&self.shared.inbox, Command::Close)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.shared.events.subscribe()
    }

    /// Resolve once the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ErrorInfo> {
        let mut state = self.shared.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| ErrorInfo::engine_stopped())
    }

    /// Round trip time of a heartbeat.
    pub async fn ping(&self) -> Result<Duration, ErrorInfo> {
        request(&self.shared.inbox, Command::Ping).await?
    }

    /// A key another client instance can use to take over this connection
    /// and its attached channels. `None` before the first connect.
    pub async fn create_recovery_key(&self) -> Result<Option<String>, ErrorInfo> {
        request(&self.shared.inbox, Command::RecoveryKey).await
    }

    /// Resolve once nothing is queued or awaiting an ack.
    pub async fn when_idle(&self) -> Result<(), ErrorInfo> {
        request(&self.shared.inbox, Command::WhenIdle).await
    }

    // -- Channels ------------------------------------------------------------

    pub fn channel(&self, name: &str) -> ChannelHandle {
        self.channel_with_options(name, ChannelOptions::default())
    }

    /// Get a channel, creating it with `options` if this client has not
    /// used it before.
    pub fn channel_with_options(&self, name: &str, options: ChannelOptions) -> ChannelHandle {
        let mut channels = self
            .shared
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = channels.get(name) {
            return handle.clone();
        }

        let buses = ChannelBuses::new();
        let handle = ChannelHandle {
            name: name.to_string(),
            inbox: self.shared.inbox.clone(),
            state: buses.state.subscribe(),
            states: buses.states.clone(),
            messages: buses.messages.clone(),
            presence: buses.presence.clone(),
        };
        debug!(channel = %name, "Channel handle created");
        let _ = post(
            &self.shared.inbox,
            Command::CreateChannel {
                name: name.to_string(),
                options,
                buses,
            },
        );
        channels.insert(name.to_string(), handle.clone());
        handle
    }

    /// Forget a channel. Fails unless it is initialized, detached or failed.
    pub async fn release(&self, name: &str) -> Result<(), ErrorInfo> {
        let name = name.to_string();
        request(&self.shared.inbox, |reply| Command::Release {
            name: name.clone(),
            reply,
        })
        .await??;
        self.shared
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&name);
        Ok(())
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChannelHandle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChannelHandle {
    name: String,
    inbox: Inbox,
    state: watch::Receiver<ChannelState>,
    states: EventBus<ChannelStateChange>,
    messages: EventBus<Message>,
    presence: EventBus<PresenceMessage>,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.states.subscribe()
    }

    /// Messages delivered on this channel. Subscribing does not attach.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    pub async fn wait_for_state(&self, target: ChannelState) -> Result<(), ErrorInfo> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| ErrorInfo::engine_stopped())
    }

    async fn op(
        &self,
        op: impl FnOnce(oneshot::Sender<Result<(), ErrorInfo>>) -> ChannelOp,
    ) -> Result<(), ErrorInfo> {
        request(&self.inbox, |reply| Command::Channel {
            name: self.name.clone(),
            op: op(reply),
        })
        .await?
    }

    pub async fn attach(&self) -> Result<(), ErrorInfo> {
        self.op(ChannelOp::Attach).await
    }

    pub async fn detach(&self) -> Result<(), ErrorInfo> {
        self.op(ChannelOp::Detach).await
    }

    /// Publish one message; resolves once the server acknowledges it.
    pub async fn publish(&self, name: impl Into<String>, data: Value) -> Result<(), ErrorInfo> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<(), ErrorInfo> {
        self.op(|reply| ChannelOp::Publish(messages, reply)).await
    }

    /// Serials, granted modes and params from the current attachment.
    pub async fn properties(&self) -> Result<ChannelProperties, ErrorInfo> {
        request(&self.inbox, |reply| Command::Channel {
            name: self.name.clone(),
            op: ChannelOp::Properties(reply),
        })
        .await
    }

    pub fn presence(&self) -> PresenceHandle {
        PresenceHandle {
            channel: self.clone(),
        }
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PresenceHandle
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PresenceHandle {
    channel: ChannelHandle,
}

impl PresenceHandle {
    async fn act(
        &self,
        action: PresenceAction,
        client_id: Option<String>,
        data: Option<Value>,
    ) -> Result<(), ErrorInfo> {
        self.channel
            .op(|reply| ChannelOp::Presence {
                action,
                client_id,
                data,
                reply,
            })
            .await
    }

    pub async fn enter(&self, data: Option<Value>) -> Result<(), ErrorInfo> {
        self.act(PresenceAction::Enter, None, data).await
    }

    pub async fn update(&self, data: Option<Value>) -> Result<(), ErrorInfo> {
        self.act(PresenceAction::Update, None, data).await
    }

    pub async fn leave(&self, data: Option<Value>) -> Result<(), ErrorInfo> {
        self.act(PresenceAction::Leave, None, data).await
    }

    pub async fn enter_client(&self, client_id: &str, data: Option<Value>) -> Result<(), ErrorInfo> {
        self.act(PresenceAction::Enter, Some(client_id.to_string()), data)
            .await
    }

    pub async fn update_client(&self, client_id: &str, data: Option<Value>) -> Result<(), ErrorInfo> {
        self.act(PresenceAction::Update, Some(client_id.to_string()), data)
            .await
    }

    pub async fn leave_client(&self, client_id: &str, data: Option<Value>) -> Result<(), ErrorInfo> {
        self.act(PresenceAction::Leave, Some(client_id.to_string()), data)
            .await
    }

    /// Current members, attaching first if needed.
    pub async fn get(&self, query: PresenceQuery) -> Result<Vec<PresenceMessage>, ErrorInfo> {
        request(&self.channel.inbox, |reply| Command::Channel {
            name: self.channel.name.clone(),
            op: ChannelOp::PresenceGet(query, reply),
        })
        .await?
    }

    /// Presence events on this channel.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceMessage> {
        self.channel.presence.subscribe()
    }
}
