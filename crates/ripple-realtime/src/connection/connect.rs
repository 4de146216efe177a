//! Opening transports, activating the winner, and everything a transport
//! reports back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manager::{ConnectionManager, Notice, PendingTransport};
use super::protocol::Protocol;
use super::state::{ConnectionState, ConnectionStateChange};
use super::AuthPurpose;
use crate::auth::AuthParams;
use crate::engine::Input;
use crate::error::{codes, ErrorInfo};
use crate::protocol::{Action, AuthDetails, ConnectionDetails, ProtocolMessage};
use crate::timers::TimerOwner;
use crate::transport::{
    ConnectMode, Transport, TransportEvent, TransportFactory, TransportFailure, TransportId,
    TransportParams, TransportSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Active,
    Pending,
    Draining,
}

impl ConnectionManager {
    // -----------------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------------

    pub(super) fn start_connect(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.connect_counter += 1;
        self.check_connection_state_freshness();

        self.suspend_timer.start_if_idle(
            &self.scheduler,
            TimerOwner::Suspend,
            self.connection_state_ttl,
        );
        self.transition_timer.start(
            &self.scheduler,
            TimerOwner::Transition,
            self.options.timeouts.connect(),
        );

        let force = self
            .error_reason
            .as_ref()
            .is_some_and(ErrorInfo::is_token_error);
        self.request_auth(AuthPurpose::Connect, force);
    }

    /// A connection unused for longer than the server keeps its state
    /// cannot be resumed.
    fn check_connection_state_freshness(&mut self) {
        let (Some(last), Some(_)) = (self.last_activity, self.connection_id.as_ref()) else {
            return;
        };
        let limit = self.connection_state_ttl + self.max_idle_interval.unwrap_or(Duration::ZERO);
        if last.elapsed() > limit {
            info!(
                since_ms = last.elapsed().as_millis() as u64,
                "Connection state is stale; starting a new connection"
            );
            self.connection_id = None;
            self.connection_key = None;
            self.msg_serial = 0;
            self.connecting_fail_state = ConnectionState::Suspended;
        }
    }

    pub(super) fn request_auth(&mut self, purpose: AuthPurpose, force_new_token: bool) {
        let attempt = self.connect_counter;
        let auth = Arc::clone(&self.auth);
        debug!(?purpose, force_new_token, "Requesting auth params");
        self.scheduler.spawn(async move {
            let result = auth.auth_params(force_new_token).await;
            Input::Auth {
                attempt,
                purpose,
                result,
            }
        });
    }

    pub fn on_auth_result(
        &mut self,
        attempt: u64,
        purpose: AuthPurpose,
        result: Result<AuthParams, ErrorInfo>,
    ) {
        if purpose != AuthPurpose::Reauth && attempt != self.connect_counter {
            debug!(attempt, current = self.connect_counter, "Dropping stale auth result");
            return;
        }
        let params = match result {
            Ok(params) => params,
            Err(err) => {
                if let AuthPurpose::Retry { id, .. } = &purpose {
                    self.proposed.remove(id);
                }
                self.act_on_error_from_authorize(err);
                return;
            }
        };

        match purpose {
            AuthPurpose::Connect => self.connect_with(params),
            AuthPurpose::Retry { id, kind } => {
                if self.proposed.remove(&id).is_none() || self.state != ConnectionState::Connecting {
                    return;
                }
                if let Some(transport_params) = self.transport_params.as_mut() {
                    transport_params.auth = params;
                }
                match self.registry.get(&kind) {
                    Some(factory) => self.spawn_attempt(factory),
                    None => warn!(kind = %kind, "Transport kind no longer registered"),
                }
            }
            AuthPurpose::Reauth => self.send_auth(params),
        }
    }

    fn connect_with(&mut self, auth: AuthParams) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        let (mode, connection_key) = match (&self.connection_key, &self.recovery) {
            (Some(key), _) => (ConnectMode::Resume, Some(key.clone())),
            (None, Some(recovery)) => (ConnectMode::Recover, Some(recovery.connection_key.clone())),
            (None, None) => (ConnectMode::Clean, None),
        };
        self.transport_params = Some(TransportParams {
            mode,
            connection_key,
            client_id: self.options.client_id.clone(),
            echo_messages: self.options.echo_messages,
            auth,
            endpoint: self.options.endpoint.clone(),
            connect_timeout: self.options.timeouts.realtime_request(),
        });

        let candidates = self.registry.candidates(&self.options.transports);
        if candidates.is_empty() {
            self.notify_state(
                ConnectionState::Failed,
                Some(ErrorInfo::new(
                    codes::CONNECTION_FAILED,
                    400,
                    "No transports available for the configured preference",
                )),
            );
            return;
        }

        info!(?mode, candidates = candidates.len(), "Connecting");
        for factory in candidates {
            self.spawn_attempt(factory);
        }
    }

    fn spawn_attempt(&mut self, factory: Arc<dyn TransportFactory>) {
        let Some(params) = self.transport_params.clone() else {
            return;
        };
        let id = self.next_transport_id;
        self.next_transport_id += 1;
        let kind = factory.kind().to_string();
        self.proposed.insert(id, kind.clone());

        let sink = TransportSink::new(id, self.scheduler.inbox().clone());
        let attempt = self.connect_counter;
        debug!(id, kind = %kind, mode = ?params.mode, "Trying transport");
        self.scheduler.spawn(async move {
            let result = factory.try_connect(params, sink).await;
            Input::Attempt {
                attempt,
                id,
                kind,
                result,
            }
        });
    }

    pub fn on_attempt_result(
        &mut self,
        attempt: u64,
        id: TransportId,
        kind: String,
        result: Result<Box<dyn Transport>, TransportFailure>,
    ) {
        let was_proposed = self.proposed.remove(&id).is_some();
        let current = attempt == self.connect_counter && was_proposed;
        let early: Vec<TransportEvent> = {
            let (mine, others) = std::mem::take(&mut self.early_events)
                .into_iter()
                .partition(|(event_id, _)| *event_id == id);
            self.early_events = others;
            mine.into_iter().map(|(_, event)| event).collect()
        };

        match result {
            Ok(mut transport) => {
                if !current || matches!(
                    self.state,
                    ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
                ) {
                    debug!(id, kind = %kind, "Disposing transport from an abandoned attempt");
                    transport.dispose();
                    return;
                }
                debug!(id, kind = %kind, "Transport opened; awaiting CONNECTED");
                self.pending.push(PendingTransport { id, transport });
                for event in early {
                    self.on_transport_event(id, event);
                }
            }
            Err(failure) if current => self.on_attempt_failed(id, kind, failure),
            Err(failure) => debug!(id, error = %failure.error(), "Ignoring failure of an abandoned attempt"),
        }
    }

    fn on_attempt_failed(&mut self, id: TransportId, kind: String, failure: TransportFailure) {
        let err = failure.error().clone();
        warn!(id, kind = %kind, error = %err, "Transport attempt failed");

        if err.is_token_error()
            && !self
                .error_reason
                .as_ref()
                .is_some_and(ErrorInfo::is_token_error)
        {
            self.error_reason = Some(err);
            info!(kind = %kind, "Retrying transport with a new token");
            self.proposed.insert(id, kind.clone());
            self.request_auth(AuthPurpose::Retry { id, kind }, true);
            return;
        }

        match failure {
            TransportFailure::Failed(err) => self.notify_state(ConnectionState::Failed, Some(err)),
            TransportFailure::Disconnected(err) if !err.is_retriable() => {
                self.notify_state(self.connecting_fail_state, Some(err));
            }
            TransportFailure::Disconnected(err) => {
                let outstanding =
                    !self.proposed.is_empty() || !self.pending.is_empty() || self.active.is_some();
                if !outstanding {
                    self.notify_state(
                        self.connecting_fail_state,
                        Some(
                            ErrorInfo::new(codes::CONNECTION_DISCONNECTED, 400, "Unable to connect")
                                .with_cause(err),
                        ),
                    );
                }
            }
        }
    }

    pub(super) fn act_on_error_from_authorize(&mut self, err: ErrorInfo) {
        warn!(error = %err, "Auth provider failed");
        if err.code == codes::TOKEN_NOT_RENEWABLE || err.code == codes::INCOMPATIBLE_CLIENT_ID {
            self.notify_state(ConnectionState::Failed, Some(err));
        } else if err.status_code == 403 {
            let reason = ErrorInfo::new(
                codes::AUTH_FAILED,
                403,
                "Client configured authentication provider returned 403; failing the connection",
            )
            .with_cause(err);
            self.notify_state(ConnectionState::Failed, Some(reason));
        } else {
            let reason = ErrorInfo::new(
                codes::AUTH_FAILED,
                401,
                "Client configured authentication provider request failed",
            )
            .with_cause(err);
            self.notify_state(self.fail_state(), Some(reason));
        }
    }

    fn send_auth(&mut self, params: AuthParams) {
        let Some(token) = params.access_token() else {
            warn!("Server requested re-auth but the provider supplied no token");
            return;
        };
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let mut message = ProtocolMessage::new(Action::Auth);
        message.auth = Some(AuthDetails {
            access_token: token.to_string(),
        });
        active.send_control(&message);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn role_of(&self, id: TransportId) -> Option<Role> {
        if self.active.as_ref().is_some_and(|p| p.id == id) {
            Some(Role::Active)
        } else if self.pending.iter().any(|p| p.id == id) {
            Some(Role::Pending)
        } else if self.draining.iter().any(|p| p.id == id) {
            Some(Role::Draining)
        } else {
            None
        }
    }

    fn protocol_mut(&mut self, id: TransportId) -> Option<&mut Protocol> {
        if self.active.as_ref().is_some_and(|p| p.id == id) {
            return self.active.as_mut();
        }
        self.draining.iter_mut().find(|p| p.id == id)
    }

    pub fn on_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        if self.role_of(id).is_none() {
            if self.proposed.contains_key(&id) {
                self.early_events.push((id, event));
            } else {
                debug!(id, "Ignoring event from a disposed transport");
            }
            return;
        }

        match event {
            TransportEvent::Message(message) => self.on_protocol_message(id, message),
            TransportEvent::Disconnected(err) => {
                self.deactivate_transport(id, ConnectionState::Disconnected, err)
            }
            TransportEvent::Closed => self.deactivate_transport(id, ConnectionState::Closed, None),
            TransportEvent::Failed(err) => {
                self.deactivate_transport(id, ConnectionState::Failed, Some(err))
            }
        }
    }

    fn on_protocol_message(&mut self, id: TransportId, message: ProtocolMessage) {
        let Some(role) = self.role_of(id) else {
            return;
        };
        self.last_activity = Some(Instant::now());
        if role == Role::Active {
            self.start_idle_timer();
        }
        debug!(id, action = %message.action, channel = ?message.channel, "Received protocol message");

        match message.action {
            Action::Heartbeat => self.on_heartbeat(message.id),
            Action::Connected => self.on_connected(id, message),
            Action::Disconnected => {
                let event = match &message.error {
                    Some(err) if err.is_unresolvable() => ConnectionState::Failed,
                    _ => ConnectionState::Disconnected,
                };
                self.deactivate_transport(id, event, message.error);
            }
            Action::Closed => self.deactivate_transport(id, ConnectionState::Closed, message.error),
            Action::Error if message.channel.is_none() => {
                let err = message
                    .error
                    .unwrap_or_else(ErrorInfo::unknown_connection_error);
                warn!(id, error = %err, "Fatal connection error from server");
                self.deactivate_transport(id, ConnectionState::Failed, Some(err));
            }
            Action::Ack => {
                let (serial, count) = (message.msg_serial.unwrap_or(0), message.count.unwrap_or(1));
                if let Some(protocol) = self.protocol_mut(id) {
                    protocol.on_ack(serial, count);
                }
                self.retire_drained(id);
            }
            Action::Nack => {
                let (serial, count) = (message.msg_serial.unwrap_or(0), message.count.unwrap_or(1));
                if let Some(protocol) = self.protocol_mut(id) {
                    protocol.on_nack(serial, count, message.error);
                }
                self.retire_drained(id);
            }
            Action::Auth if role == Role::Active => self.request_auth(AuthPurpose::Reauth, true),
            _ if role == Role::Active || (role == Role::Draining && message.action == Action::Error) => {
                self.outbox.push_back(Notice::ChannelMessage(message));
            }
            _ => debug!(id, action = %message.action, "Dropping message from an inactive transport"),
        }
    }

    /// A superseded protocol with nothing left in flight is let go.
    fn retire_drained(&mut self, id: TransportId) {
        if let Some(index) = self
            .draining
            .iter()
            .position(|p| p.id == id && p.pending_count() == 0)
        {
            let mut protocol = self.draining.remove(index);
            debug!(id, "Superseded transport drained");
            protocol.disconnect(None);
        }
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    fn on_connected(&mut self, id: TransportId, message: ProtocolMessage) {
        let details = message.connection_details.clone().unwrap_or_default();

        if self.active.as_ref().is_some_and(|p| p.id == id) {
            if let Err(err) = self.apply_connection_details(&details) {
                self.notify_state(ConnectionState::Failed, Some(err));
                return;
            }
            let key = details.connection_key.clone().or(message.connection_key.clone());
            self.set_connection(message.connection_id.clone(), key, message.error.is_some());
            if let Some(err) = &message.error {
                self.error_reason = Some(err.clone());
            }
            self.outbox
                .push_back(Notice::StateChanged(ConnectionStateChange::update(
                    self.state,
                    message.error,
                )));
            return;
        }

        let Some(index) = self.pending.iter().position(|p| p.id == id) else {
            return;
        };
        let PendingTransport { id, transport } = self.pending.remove(index);
        self.activate_transport(id, transport, message, details);
    }

    fn activate_transport(
        &mut self,
        id: TransportId,
        mut transport: Box<dyn Transport>,
        message: ProtocolMessage,
        details: ConnectionDetails,
    ) {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
        ) {
            debug!(id, state = %self.state, "Not activating transport");
            transport.dispose();
            return;
        }
        info!(id, kind = transport.kind(), "Activating transport");

        // The race is over.
        self.proposed.clear();
        self.early_events.clear();
        for mut other in self.pending.drain(..) {
            other.transport.dispose();
        }

        let previous = self.active.replace(Protocol::new(id, transport));
        if let Some(mut previous) = previous {
            previous.finish();
            if previous.pending_count() > 0 {
                debug!(id = previous.id, "Draining superseded transport");
                self.draining.push(previous);
            } else {
                previous.disconnect(None);
            }
        }

        let key = details.connection_key.clone().or(message.connection_key.clone());
        self.set_connection(message.connection_id.clone(), key, message.error.is_some());
        if let Err(err) = self.apply_connection_details(&details) {
            self.notify_state(ConnectionState::Failed, Some(err));
            return;
        }
        self.recovery = None;
        self.start_idle_timer();

        if self.state == ConnectionState::Connected {
            if let Some(err) = &message.error {
                self.error_reason = Some(err.clone());
            }
            self.outbox
                .push_back(Notice::StateChanged(ConnectionStateChange::update(
                    self.state,
                    message.error,
                )));
        } else {
            self.notify_state(ConnectionState::Connected, message.error.clone());
            self.error_reason = message.error;
        }
        self.outbox.push_back(Notice::TransportActive);
    }

    fn set_connection(&mut self, connection_id: Option<String>, key: Option<String>, has_error: bool) {
        let previous = self.connection_id.clone();
        let id_changed = previous.is_some() && previous != connection_id;
        let recover_failed = previous.is_none() && self.recovery.is_some() && has_error;
        if id_changed || recover_failed {
            info!(
                previous = ?previous,
                current = ?connection_id,
                "New connection; resetting message serial"
            );
            self.msg_serial = 0;
            self.queued.reset_send_attempted();
        }
        self.connection_id = connection_id;
        self.connection_key = key;
    }

    fn apply_connection_details(&mut self, details: &ConnectionDetails) -> Result<(), ErrorInfo> {
        if let Some(client_id) = &details.client_id {
            if let Some(configured) = self.options.client_id.as_deref() {
                if configured != client_id {
                    return Err(ErrorInfo::new(
                        codes::INCOMPATIBLE_CLIENT_ID,
                        401,
                        format!(
                            "Unexpected client id mismatch: client has {configured}, server has {client_id}"
                        ),
                    ));
                }
            }
            self.client_id = Some(client_id.clone());
        }
        if let Some(size) = details.max_message_size {
            self.max_message_size = size as usize;
        }
        if let Some(ttl) = details.connection_state_ttl {
            self.connection_state_ttl = Duration::from_millis(ttl);
        }
        if let Some(idle) = details.max_idle_interval {
            self.max_idle_interval = (idle > 0).then(|| Duration::from_millis(idle));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deactivation
    // -----------------------------------------------------------------------

    /// A transport went away with `event` (disconnected, closed or failed).
    pub(super) fn deactivate_transport(
        &mut self,
        id: TransportId,
        event: ConnectionState,
        error: Option<ErrorInfo>,
    ) {
        let was_active = self.active.as_ref().is_some_and(|p| p.id == id);
        let was_pending = match self.pending.iter().position(|p| p.id == id) {
            Some(index) => {
                let mut pending = self.pending.remove(index);
                pending.transport.dispose();
                true
            }
            None => false,
        };
        let was_proposed = self.proposed.remove(&id).is_some();
        if let Some(index) = self.draining.iter().position(|p| p.id == id) {
            let mut protocol = self.draining.remove(index);
            self.queued.prepend(protocol.take_pending());
            protocol.dispose();
        }

        if was_active {
            if let Some(mut protocol) = self.active.take() {
                let in_flight = protocol.take_pending();
                if !in_flight.is_empty() {
                    debug!(id, count = in_flight.len(), "Requeueing in-flight messages");
                }
                self.queued.prepend(in_flight);
                protocol.dispose();
            }
        }
        debug!(id, event = %event, was_active, was_pending, was_proposed, error = ?error, "Transport inactive");

        let nothing_scheduled = self.pending.is_empty() && self.proposed.is_empty();
        let should_notify = (was_active && nothing_scheduled)
            || (was_active && event == ConnectionState::Failed)
            || (event == ConnectionState::Closed && (was_active || self.active.is_none()))
            || (self.active.is_none() && was_pending && nothing_scheduled);

        if should_notify {
            let state = if event == ConnectionState::Failed
                && error.as_ref().is_some_and(ErrorInfo::is_token_error)
            {
                ConnectionState::Disconnected
            } else {
                event
            };
            self.notify_state(state, error);
            return;
        }

        if was_active && event == ConnectionState::Disconnected {
            // Another transport is still on its way up.
            self.notify_state(ConnectionState::Connecting, None);
            self.transition_timer.start(
                &self.scheduler,
                TimerOwner::Transition,
                self.options.timeouts.connect(),
            );
            self.suspend_timer.start_if_idle(
                &self.scheduler,
                TimerOwner::Suspend,
                self.connection_state_ttl,
            );
        }
    }
}
