//! The engine task: sole owner of the connection and the channels.
//!
//! Application commands, transport events, connect results and timer
//! firings all arrive on one inbox and are handled one at a time, so no
//! state is shared between tasks.

use std::sync::Arc;
use std::time::Duration;

use ripple_common::EventBus;
use ripple_config::ClientOptions;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::auth::{AuthParams, AuthProvider};
use crate::channel::{ChannelBuses, ChannelOptions, ChannelProperties, Channels, Reply};
use crate::codec::MessageCodec;
use crate::connection::{AuthPurpose, ConnectionManager, ConnectionState, ConnectionStateChange, Notice};
use crate::error::ErrorInfo;
use crate::presence::{PresenceQuery, PresenceReply};
use crate::protocol::{Message, PresenceAction};
use crate::timers::{Scheduler, TimerFired, TimerOwner};
use crate::transport::{Transport, TransportEvent, TransportFailure, TransportId, TransportRegistry};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

pub(crate) enum Input {
    Command(Command),
    Transport {
        id: TransportId,
        event: TransportEvent,
    },
    Attempt {
        attempt: u64,
        id: TransportId,
        kind: String,
        result: Result<Box<dyn Transport>, TransportFailure>,
    },
    Auth {
        attempt: u64,
        purpose: AuthPurpose,
        result: Result<AuthParams, ErrorInfo>,
    },
    Timer(TimerFired),
}

pub(crate) enum Command {
    Connect,
    Close,
    Ping(oneshot::Sender<Result<Duration, ErrorInfo>>),
    WhenIdle(oneshot::Sender<()>),
    RecoveryKey(oneshot::Sender<Option<String>>),
    CreateChannel {
        name: String,
        options: ChannelOptions,
        buses: ChannelBuses,
    },
    Channel {
        name: String,
        op: ChannelOp,
    },
    Release {
        name: String,
        reply: Reply,
    },
    Shutdown,
}

pub(crate) enum ChannelOp {
    Attach(Reply),
    Detach(Reply),
    Publish(Vec<Message>, Reply),
    Presence {
        action: PresenceAction,
        client_id: Option<String>,
        data: Option<Value>,
        reply: Reply,
    },
    PresenceGet(PresenceQuery, PresenceReply),
    Properties(oneshot::Sender<ChannelProperties>),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) struct Engine {
    pub(crate) conn: ConnectionManager,
    pub(crate) channels: Channels,
    state_tx: watch::Sender<ConnectionState>,
    events: EventBus<ConnectionStateChange>,
}

impl Engine {
    pub fn new(
        options: ClientOptions,
        registry: TransportRegistry,
        auth: Arc<dyn AuthProvider>,
        codec: Arc<dyn MessageCodec>,
        inbox: mpsc::UnboundedSender<Input>,
        state_tx: watch::Sender<ConnectionState>,
        events: EventBus<ConnectionStateChange>,
    ) -> Self {
        let scheduler = Scheduler::new(inbox);
        let mut conn = ConnectionManager::new(options, registry, auth, scheduler.clone());
        let mut channels = Channels::new(codec, scheduler);
        let recovered = conn.take_recovered_channels();
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovering channels");
            channels.recover_channels(recovered);
        }
        Self {
            conn,
            channels,
            state_tx,
            events,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Input>) {
        info!("Realtime engine started");
        while let Some(input) = inbox.recv().await {
            if !self.handle(input) {
                break;
            }
        }
        self.conn.shutdown();
        self.drain_notices();
        info!(channels = self.channels.len(), "Realtime engine stopped");
    }

    /// Handle one input; returns false once the engine should stop.
    pub fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(Command::Shutdown) => return false,
            Input::Command(command) => self.on_command(command),
            Input::Transport { id, event } => self.conn.on_transport_event(id, event),
            Input::Attempt {
                attempt,
                id,
                kind,
                result,
            } => self.conn.on_attempt_result(attempt, id, kind, result),
            Input::Auth {
                attempt,
                purpose,
                result,
            } => self.conn.on_auth_result(attempt, purpose, result),
            Input::Timer(fired) => match fired.owner {
                TimerOwner::ChannelState(_) | TimerOwner::ChannelRetry(_) => {
                    self.channels.on_timer(fired, &mut self.conn)
                }
                _ => self.conn.on_timer(fired),
            },
        }
        self.drain_notices();
        true
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if let Err(e) = self.conn.request_state(ConnectionState::Connecting, None) {
                    warn!(error = %e, "Connect refused");
                }
            }
            Command::Close => {
                if let Err(e) = self.conn.request_state(ConnectionState::Closing, None) {
                    warn!(error = %e, "Close refused");
                }
            }
            Command::Ping(reply) => self.conn.ping(reply),
            Command::WhenIdle(reply) => self.conn.once_idle(reply),
            Command::RecoveryKey(reply) => {
                let key = self.conn.create_recovery_key(self.channels.channel_serials());
                let _ = reply.send(key);
            }
            Command::CreateChannel {
                name,
                options,
                buses,
            } => {
                self.channels.get_or_create(&name, options, Some(buses));
            }
            Command::Channel { name, op } => self.on_channel_op(&name, op),
            Command::Release { name, reply } => {
                let _ = reply.send(self.channels.release(&name));
            }
            Command::Shutdown => {}
        }
    }

    fn on_channel_op(&mut self, name: &str, op: ChannelOp) {
        if self.channels.get_mut(name).is_none() {
            debug!(channel = %name, "Operation on unknown channel; creating it");
            self.channels.get_or_create(name, ChannelOptions::default(), None);
        }
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        let conn = &mut self.conn;
        match op {
            ChannelOp::Attach(reply) => channel.attach(conn, Some(reply)),
            ChannelOp::Detach(reply) => channel.detach(conn, reply),
            ChannelOp::Publish(messages, reply) => channel.publish(messages, conn, reply),
            ChannelOp::Presence {
                action,
                client_id,
                data,
                reply,
            } => channel.update_presence(action, client_id, data, conn, reply),
            ChannelOp::PresenceGet(query, reply) => channel.presence_get(query, conn, reply),
            ChannelOp::Properties(reply) => {
                let _ = reply.send(channel.properties.clone());
            }
        }
    }

    /// Route everything the connection raised while handling an input.
    fn drain_notices(&mut self) {
        while let Some(notice) = self.conn.take_notice() {
            match notice {
                Notice::StateChanged(change) => {
                    self.state_tx.send_replace(change.current);
                    self.events.publish(change);
                }
                Notice::ChannelMessage(message) => {
                    self.channels.process_channel_message(message, &mut self.conn)
                }
                Notice::TransportActive => self.channels.on_transport_active(&mut self.conn),
                Notice::Interrupted { state, reason } => {
                    self.channels
                        .propagate_connection_interruption(state, reason, &mut self.conn)
                }
            }
        }
        self.conn.check_idle();
    }
}
