use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ripple_common::new_correlation_id;
use ripple_config::{ClientOptions, TimeoutConfig};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::pending::{PendingMessage, SendCallback};
use super::protocol::Protocol;
use super::queue::MessageQueue;
use super::recovery::RecoveryContext;
use super::state::{ConnectionState, ConnectionStateChange};
use crate::auth::AuthProvider;
use crate::backoff::retry_delay;
use crate::error::{codes, ErrorInfo};
use crate::protocol::{Action, ProtocolMessage};
use crate::timers::{Scheduler, TimerFired, TimerOwner, TimerSlot};
use crate::transport::{Transport, TransportEvent, TransportId, TransportParams, TransportRegistry};

/// Work for the rest of the engine, raised while handling an input and
/// drained once that input is done.
#[derive(Debug)]
pub(crate) enum Notice {
    StateChanged(ConnectionStateChange),
    /// A protocol message addressed to a channel.
    ChannelMessage(ProtocolMessage),
    /// A transport became active; channels resume their pending operations.
    TransportActive,
    /// The connection entered a state that neither queues nor sends.
    Interrupted {
        state: ConnectionState,
        reason: Option<ErrorInfo>,
    },
}

pub(super) struct PendingTransport {
    pub id: TransportId,
    pub transport: Box<dyn Transport>,
}

struct PendingPing {
    started: Instant,
    reply: oneshot::Sender<Result<Duration, ErrorInfo>>,
    timer: TimerSlot,
}

pub(crate) struct ConnectionManager {
    pub(super) options: ClientOptions,
    pub(super) registry: TransportRegistry,
    pub(super) auth: Arc<dyn AuthProvider>,
    pub(super) scheduler: Scheduler,

    pub(super) state: ConnectionState,
    pub(super) error_reason: Option<ErrorInfo>,
    pub(super) connecting_fail_state: ConnectionState,

    pub(super) connection_id: Option<String>,
    pub(super) connection_key: Option<String>,
    pub(super) client_id: Option<String>,
    pub(super) msg_serial: u64,
    pub(super) max_message_size: usize,
    pub(super) connection_state_ttl: Duration,
    pub(super) max_idle_interval: Option<Duration>,
    pub(super) last_activity: Option<Instant>,
    pub(super) recovery: Option<RecoveryContext>,

    disconnected_retry_count: u32,
    last_auto_reconnect: Option<Instant>,

    /// Bumped per connect attempt; async results from older attempts are dropped.
    pub(super) connect_counter: u64,
    pub(super) next_transport_id: TransportId,
    pub(super) transport_params: Option<TransportParams>,
    /// Candidates still opening, by id, with their kind.
    pub(super) proposed: HashMap<TransportId, String>,
    /// Events a candidate reported before its connect attempt returned.
    pub(super) early_events: Vec<(TransportId, TransportEvent)>,
    /// Opened transports waiting for CONNECTED.
    pub(super) pending: Vec<PendingTransport>,
    pub(super) active: Option<Protocol>,
    /// Superseded protocols waiting for their last acks.
    pub(super) draining: Vec<Protocol>,
    pub(super) queued: MessageQueue,

    pub(super) transition_timer: TimerSlot,
    pub(super) suspend_timer: TimerSlot,
    retry_timer: TimerSlot,
    pings: HashMap<String, PendingPing>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    pub(super) outbox: VecDeque<Notice>,
}

impl ConnectionManager {
    pub fn new(
        options: ClientOptions,
        registry: TransportRegistry,
        auth: Arc<dyn AuthProvider>,
        scheduler: Scheduler,
    ) -> Self {
        let recovery = options.recover.as_deref().and_then(RecoveryContext::decode);
        let msg_serial = recovery.as_ref().map_or(0, |r| r.msg_serial);
        let connection_state_ttl = options.timeouts.connection_state_ttl();
        Self {
            max_message_size: options.max_message_size as usize,
            client_id: options.client_id.clone(),
            options,
            registry,
            auth,
            scheduler,
            state: ConnectionState::Initialized,
            error_reason: None,
            connecting_fail_state: ConnectionState::Disconnected,
            connection_id: None,
            connection_key: None,
            msg_serial,
            connection_state_ttl,
            max_idle_interval: None,
            last_activity: None,
            recovery,
            disconnected_retry_count: 0,
            last_auto_reconnect: None,
            connect_counter: 0,
            next_transport_id: 1,
            transport_params: None,
            proposed: HashMap::new(),
            early_events: Vec::new(),
            pending: Vec::new(),
            active: None,
            draining: Vec::new(),
            queued: MessageQueue::new(),
            transition_timer: TimerSlot::default(),
            suspend_timer: TimerSlot::default(),
            retry_timer: TimerSlot::default(),
            pings: HashMap::new(),
            idle_waiters: Vec::new(),
            outbox: VecDeque::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn can_send(&self) -> bool {
        self.state.send_events()
    }

    /// Connected, or in a state that will get there on its own.
    pub fn is_active(&self) -> bool {
        self.state.queue_events() || self.state.send_events()
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.error_reason.clone()
    }

    /// The error to report for an operation the current state refuses.
    pub fn state_error(&self) -> ErrorInfo {
        self.error_reason
            .clone()
            .or_else(|| self.state.default_error())
            .unwrap_or_else(ErrorInfo::unknown_connection_error)
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn queue_messages(&self) -> bool {
        self.options.queue_messages
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.options.timeouts
    }

    pub fn take_notice(&mut self) -> Option<Notice> {
        self.outbox.pop_front()
    }

    /// Channel serials seeded from a recovery key.
    pub fn take_recovered_channels(&mut self) -> BTreeMap<String, String> {
        self.recovery
            .as_mut()
            .map(|r| std::mem::take(&mut r.channel_serials))
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // State Machine
    // -----------------------------------------------------------------------

    /// A state change asked for by the application or a timer.
    pub fn request_state(
        &mut self,
        state: ConnectionState,
        reason: Option<ErrorInfo>,
    ) -> Result<(), ErrorInfo> {
        if self.state == ConnectionState::Failed {
            return Err(self.state_error());
        }
        if state == self.state {
            return Ok(());
        }

        self.transition_timer.cancel();
        self.retry_timer.cancel();
        self.check_suspend_timer(state);

        if state == ConnectionState::Connecting && self.state == ConnectionState::Connected {
            return Ok(());
        }
        if state == ConnectionState::Closing && self.state == ConnectionState::Closed {
            return Ok(());
        }

        let reason = reason.or_else(|| state.default_error());
        let change = ConnectionStateChange::new(self.state, state, None, reason.clone());
        self.enact_state_change(change);
        if !state.queue_events() && !state.send_events() {
            self.interrupt(state, reason);
        }

        match state {
            ConnectionState::Connecting => self.start_connect(),
            ConnectionState::Closing => self.close_impl(),
            _ => {}
        }
        Ok(())
    }

    /// A state change caused by the transports or the server.
    pub fn notify_state(&mut self, state: ConnectionState, error: Option<ErrorInfo>) {
        self.notify_state_with(state, error, false);
    }

    pub(super) fn notify_state_with(
        &mut self,
        state: ConnectionState,
        error: Option<ErrorInfo>,
        retry_now: bool,
    ) {
        let current = self.state;
        let first_token_error = current == ConnectionState::Connecting
            && error.as_ref().is_some_and(ErrorInfo::is_token_error)
            && !self.error_reason.as_ref().is_some_and(ErrorInfo::is_token_error);
        let retry_immediately = state == ConnectionState::Disconnected
            && (current == ConnectionState::Connected || retry_now || first_token_error);

        if state == current {
            return;
        }

        self.transition_timer.cancel();
        self.retry_timer.cancel();
        self.check_suspend_timer(state);

        if matches!(state, ConnectionState::Suspended | ConnectionState::Connected) {
            self.disconnected_retry_count = 0;
        }

        if current.is_terminal() {
            return;
        }

        let mut retry_in = state.retry_delay(&self.options.timeouts);
        if state == ConnectionState::Disconnected {
            self.disconnected_retry_count += 1;
            retry_in = Some(retry_delay(
                self.options.timeouts.disconnected_retry(),
                self.disconnected_retry_count,
            ));
        }

        if retry_immediately {
            self.schedule_immediate_reconnect();
            retry_in = Some(Duration::ZERO);
        } else if let (true, Some(delay)) = (
            matches!(state, ConnectionState::Disconnected | ConnectionState::Suspended),
            retry_in,
        ) {
            self.retry_timer
                .start(&self.scheduler, TimerOwner::Retry, delay);
        }

        if (state == ConnectionState::Disconnected && !retry_immediately)
            || state == ConnectionState::Suspended
            || state.is_terminal()
            || (!state.send_events() && self.active.is_some())
        {
            self.disconnect_all_transports();
        }

        let reason = error.or_else(|| state.default_error());
        let change = ConnectionStateChange::new(current, state, retry_in, reason.clone());
        self.enact_state_change(change);

        if state.send_events() {
            self.send_queued_messages();
        } else if !state.queue_events() {
            self.interrupt(state, reason);
        }
    }

    /// Tell the channels, and fail whatever was waiting to be sent.
    fn interrupt(&mut self, state: ConnectionState, reason: Option<ErrorInfo>) {
        self.outbox.push_back(Notice::Interrupted {
            state,
            reason: reason.clone(),
        });
        self.fail_queued_messages(reason.unwrap_or_else(|| self.state_error()));
    }

    fn enact_state_change(&mut self, change: ConnectionStateChange) {
        if change.current == ConnectionState::Failed {
            error!(
                from = %change.previous,
                to = %change.current,
                reason = ?change.reason,
                "Connection state changed"
            );
        } else {
            info!(
                from = %change.previous,
                to = %change.current,
                retry_in_ms = change.retry_in.map(|d| d.as_millis() as u64),
                reason = ?change.reason.as_ref().map(|r| r.code),
                "Connection state changed"
            );
        }

        self.state = change.current;
        if let Some(reason) = &change.reason {
            self.error_reason = Some(reason.clone());
        }
        if self.state.is_terminal() || self.state == ConnectionState::Suspended {
            self.clear_connection();
        }
        self.outbox.push_back(Notice::StateChanged(change));
    }

    fn clear_connection(&mut self) {
        self.connection_id = None;
        self.connection_key = None;
        self.msg_serial = 0;
        self.recovery = None;
    }

    /// The state a failure moves to from the current one.
    pub(super) fn fail_state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::Connecting => self.connecting_fail_state,
            ConnectionState::Closing => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }

    fn check_suspend_timer(&mut self, state: ConnectionState) {
        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Suspended | ConnectionState::Connecting
        ) {
            self.cancel_suspend_timer();
        }
    }

    pub(super) fn cancel_suspend_timer(&mut self) {
        self.connecting_fail_state = ConnectionState::Disconnected;
        self.suspend_timer.cancel();
    }

    /// Reconnect right away, but not more than once a second.
    fn schedule_immediate_reconnect(&mut self) {
        let delay = self
            .last_auto_reconnect
            .map(|last| Duration::from_secs(1).saturating_sub(last.elapsed()))
            .unwrap_or(Duration::ZERO);
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling immediate reconnect");
        self.retry_timer
            .start(&self.scheduler, TimerOwner::Retry, delay);
    }

    /// Drop every transport; in-flight messages go back on the queue.
    pub(super) fn disconnect_all_transports(&mut self) {
        self.proposed.clear();
        self.early_events.clear();
        for mut pending in self.pending.drain(..) {
            debug!(id = pending.id, "Disposing pending transport");
            pending.transport.dispose();
        }
        if let Some(mut active) = self.active.take() {
            debug!(id = active.id, kind = active.kind(), "Disconnecting active transport");
            self.queued.prepend(active.take_pending());
            active.disconnect(None);
        }
        for mut protocol in std::mem::take(&mut self.draining) {
            self.queued.prepend(protocol.take_pending());
            protocol.dispose();
        }
    }

    fn close_impl(&mut self) {
        self.cancel_suspend_timer();
        self.transition_timer.start(
            &self.scheduler,
            TimerOwner::Transition,
            self.options.timeouts.realtime_request(),
        );

        // Abandon any connect attempt in progress.
        self.connect_counter += 1;
        self.proposed.clear();
        self.early_events.clear();
        for mut pending in self.pending.drain(..) {
            pending.transport.dispose();
        }

        match self.active.as_mut() {
            Some(active) => {
                debug!(id = active.id, "Closing active transport");
                active.close();
            }
            None => self.notify_state(ConnectionState::Closed, None),
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send now, queue for later, or fail, depending on the state.
    pub fn send(&mut self, message: ProtocolMessage, queueable: bool, callbacks: Vec<SendCallback>) {
        let pending = PendingMessage::new(message, callbacks);
        if self.state.send_events() {
            self.send_impl(pending);
        } else if queueable && self.state.queue_events() {
            self.queue(pending);
        } else {
            debug!(
                state = %self.state,
                queueable,
                action = %pending.message.action,
                "Rejecting outbound message"
            );
            let err = self.error_reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(
                    codes::CHANNEL_OPERATION_FAILED,
                    400,
                    format!(
                        "rejecting event, queueEvent was {queueable}, state was {}",
                        self.state
                    ),
                )
            });
            pending.complete(Err(err));
        }
    }

    fn send_impl(&mut self, mut pending: PendingMessage) {
        if pending.ack_required && !pending.send_attempted {
            pending.message.msg_serial = Some(self.msg_serial);
            self.msg_serial += 1;
        }
        match self.active.as_mut() {
            Some(active) => active.send(pending),
            None => {
                warn!("No active transport in a sending state; queueing");
                self.queued.push(pending);
            }
        }
    }

    fn queue(&mut self, pending: PendingMessage) {
        debug!(action = %pending.message.action, channel = ?pending.message.channel, "Queueing message");
        let max = self.max_message_size;
        let pending = match self.queued.last_mut() {
            Some(last) => match last.try_bundle(pending, max) {
                Ok(()) => return,
                Err(unbundled) => unbundled,
            },
            None => pending,
        };
        self.queued.push(pending);
    }

    fn send_queued_messages(&mut self) {
        if !self.queued.is_empty() {
            debug!(count = self.queued.len(), "Sending queued messages");
        }
        while let Some(pending) = self.queued.shift() {
            self.send_impl(pending);
        }
    }

    fn fail_queued_messages(&mut self, error: ErrorInfo) {
        let failed = self.queued.drain();
        if !failed.is_empty() {
            warn!(count = failed.len(), error = %error, "Failing queued messages");
        }
        for pending in failed {
            pending.complete(Err(error.clone()));
        }
    }

    /// Resolve `listener` once nothing is queued or awaiting an ack.
    pub fn once_idle(&mut self, listener: oneshot::Sender<()>) {
        self.idle_waiters.push(listener);
        self.check_idle();
    }

    pub fn check_idle(&mut self) {
        if self.idle_waiters.is_empty() {
            return;
        }
        let busy = !self.queued.is_empty()
            || self.active.as_ref().is_some_and(|p| p.pending_count() > 0)
            || self.draining.iter().any(|p| p.pending_count() > 0);
        if !busy {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ping / Recovery
    // -----------------------------------------------------------------------

    pub fn ping(&mut self, reply: oneshot::Sender<Result<Duration, ErrorInfo>>) {
        let connected = self.state == ConnectionState::Connected;
        let Some(active) = self.active.as_mut().filter(|_| connected) else {
            let _ = reply.send(Err(ErrorInfo::new(
                codes::BAD_REQUEST,
                400,
                "Unable to ping service; not connected",
            )));
            return;
        };

        let id = new_correlation_id();
        let mut heartbeat = ProtocolMessage::new(Action::Heartbeat);
        heartbeat.id = Some(id.clone());
        active.send_control(&heartbeat);

        let mut timer = TimerSlot::default();
        timer.start(
            &self.scheduler,
            TimerOwner::Ping(id.clone()),
            self.options.timeouts.realtime_request(),
        );
        self.pings.insert(
            id,
            PendingPing {
                started: Instant::now(),
                reply,
                timer,
            },
        );
    }

    pub(super) fn on_heartbeat(&mut self, id: Option<String>) {
        let Some(ping) = id.and_then(|id| self.pings.remove(&id)) else {
            return;
        };
        let _ = ping.reply.send(Ok(ping.started.elapsed()));
    }

    pub fn create_recovery_key(&self, channel_serials: BTreeMap<String, String>) -> Option<String> {
        let connection_key = self.connection_key.clone()?;
        RecoveryContext {
            connection_key,
            msg_serial: self.msg_serial,
            channel_serials,
        }
        .encode()
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    pub fn on_timer(&mut self, fired: TimerFired) {
        match fired.owner {
            TimerOwner::Transition if self.transition_timer.claim(fired.generation) => {
                match self.state {
                    ConnectionState::Connecting => {
                        info!("Connect attempt timed out");
                        self.notify_state(self.connecting_fail_state, None);
                    }
                    ConnectionState::Closing => {
                        info!("Close timed out; closing anyway");
                        self.notify_state(ConnectionState::Closed, None);
                    }
                    _ => {}
                }
            }
            TimerOwner::Suspend if self.suspend_timer.claim(fired.generation) => {
                self.connecting_fail_state = ConnectionState::Suspended;
                self.notify_state(ConnectionState::Suspended, None);
            }
            TimerOwner::Retry if self.retry_timer.claim(fired.generation) => {
                if matches!(
                    self.state,
                    ConnectionState::Disconnected | ConnectionState::Suspended
                ) {
                    if self.state == ConnectionState::Disconnected {
                        self.last_auto_reconnect = Some(Instant::now());
                    }
                    if let Err(e) = self.request_state(ConnectionState::Connecting, None) {
                        warn!(error = %e, "Reconnect refused");
                    }
                }
            }
            TimerOwner::Idle(id) => {
                let claimed = self
                    .active
                    .as_mut()
                    .filter(|active| active.id == id)
                    .is_some_and(|active| active.idle_timer.claim(fired.generation));
                if claimed {
                    let since = self
                        .last_activity
                        .map_or(0, |t| t.elapsed().as_millis() as u64);
                    let err = ErrorInfo::new(
                        codes::CONNECTION_DISCONNECTED,
                        408,
                        format!(
                            "No activity seen from realtime in {since}ms; assuming connection has dropped"
                        ),
                    );
                    warn!(id, since_ms = since, "Transport idle");
                    self.deactivate_transport(id, ConnectionState::Disconnected, Some(err));
                }
            }
            TimerOwner::Ping(id) => {
                let expired = self
                    .pings
                    .get_mut(&id)
                    .is_some_and(|ping| ping.timer.claim(fired.generation));
                if let Some(ping) = expired.then(|| self.pings.remove(&id)).flatten() {
                    let _ = ping.reply.send(Err(ErrorInfo::new(
                        codes::INTERNAL,
                        500,
                        "Timeout waiting for heartbeat response",
                    )));
                }
            }
            owner => debug!(?owner, "Ignoring stale timer"),
        }
    }

    pub(super) fn start_idle_timer(&mut self) {
        let (Some(max_idle), Some(active)) = (self.max_idle_interval, self.active.as_mut()) else {
            return;
        };
        let after = max_idle + self.options.timeouts.realtime_request();
        active
            .idle_timer
            .start(&self.scheduler, TimerOwner::Idle(active.id), after);
    }

    /// Tear everything down when the engine stops.
    pub fn shutdown(&mut self) {
        self.transition_timer.cancel();
        self.suspend_timer.cancel();
        self.retry_timer.cancel();
        self.disconnect_all_transports();
        self.fail_queued_messages(ErrorInfo::engine_stopped());
        for (_, ping) in self.pings.drain() {
            let _ = ping.reply.send(Err(ErrorInfo::engine_stopped()));
        }
    }
}
