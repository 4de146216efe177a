use std::collections::BTreeMap;
use std::sync::Arc;

use ripple_common::EventBus;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::options::{ChannelMode, ChannelOptions};
use super::state::{ChannelEvent, ChannelState, ChannelStateChange};
use crate::backoff::retry_delay;
use crate::codec::MessageCodec;
use crate::connection::{ConnectionManager, SendCallback};
use crate::error::{codes, ErrorInfo};
use crate::presence::{PresenceQuery, PresenceReply, RealtimePresence};
use crate::protocol::{flags, Action, Message, PresenceMessage, ProtocolMessage};
use crate::timers::{Scheduler, TimerOwner, TimerSlot};

pub(crate) type Reply = oneshot::Sender<Result<(), ErrorInfo>>;

/// Adapt a oneshot reply into a send completion.
pub(crate) fn reply_callback(reply: Reply) -> SendCallback {
    Box::new(move |result| {
        let _ = reply.send(result);
    })
}

/// Where a channel reports to its handles.
pub(crate) struct ChannelBuses {
    pub states: EventBus<ChannelStateChange>,
    pub messages: EventBus<Message>,
    pub presence: EventBus<PresenceMessage>,
    pub state: watch::Sender<ChannelState>,
}

impl ChannelBuses {
    pub fn new() -> Self {
        Self {
            states: EventBus::new(64),
            messages: EventBus::new(256),
            presence: EventBus::new(256),
            state: watch::channel(ChannelState::Initialized).0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelProperties {
    /// Channel serial of the ATTACHED that began the current attachment.
    pub attach_serial: Option<String>,
    /// Latest channel serial seen; sent on re-attach to resume.
    pub channel_serial: Option<String>,
    /// Modes the server granted on the last ATTACHED.
    pub modes: Vec<ChannelMode>,
    /// Params the server echoed on the last ATTACHED.
    pub params: Option<BTreeMap<String, String>>,
}

/// Continuity of delivered messages, for delta decoding.
#[derive(Debug, Default)]
struct LastPayload {
    message_id: Option<String>,
    protocol_message_channel_serial: Option<String>,
    decode_failure_recovery_in_progress: bool,
}

/// Someone waiting for the channel to settle.
enum Waiter {
    Attach(Reply),
    Detach(Reply),
    PresenceGet(PresenceQuery, PresenceReply),
}

#[derive(Debug, Clone, Copy, Default)]
struct AttachFlags {
    resumed: bool,
    has_presence: bool,
    has_backlog: bool,
}

pub(crate) struct RealtimeChannel {
    pub(crate) name: String,
    pub(crate) options: ChannelOptions,
    pub(crate) state: ChannelState,
    pub(crate) error_reason: Option<ErrorInfo>,
    pub(crate) properties: ChannelProperties,
    attach_resume: bool,
    sync_channel_serial: Option<String>,
    last_payload: LastPayload,
    retry_count: u32,
    state_timer: TimerSlot,
    retry_timer: TimerSlot,
    waiters: Vec<Waiter>,
    pub(crate) presence: RealtimePresence,
    pub(crate) codec: Arc<dyn MessageCodec>,
    scheduler: Scheduler,
    buses: ChannelBuses,
}

impl RealtimeChannel {
    pub fn new(
        name: &str,
        options: ChannelOptions,
        codec: Arc<dyn MessageCodec>,
        scheduler: Scheduler,
        buses: ChannelBuses,
    ) -> Self {
        Self {
            name: name.to_string(),
            options,
            state: ChannelState::Initialized,
            error_reason: None,
            properties: ChannelProperties::default(),
            attach_resume: false,
            sync_channel_serial: None,
            last_payload: LastPayload::default(),
            retry_count: 0,
            state_timer: TimerSlot::default(),
            retry_timer: TimerSlot::default(),
            waiters: Vec::new(),
            presence: RealtimePresence::new(name, buses.presence.clone()),
            codec,
            scheduler,
            buses,
        }
    }

    /// Report to a new set of handles from now on.
    pub fn adopt_buses(&mut self, buses: ChannelBuses) {
        buses.state.send_replace(self.state);
        self.presence.rebind(buses.presence.clone());
        self.buses = buses;
    }

    // -----------------------------------------------------------------------
    // Attach / Detach
    // -----------------------------------------------------------------------

    pub fn attach(&mut self, conn: &mut ConnectionManager, reply: Option<Reply>) {
        if self.state == ChannelState::Attached {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        if !conn.is_active() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(conn.state_error()));
            }
            return;
        }
        if self.state != ChannelState::Attaching {
            self.request_state(ChannelState::Attaching, None, conn);
        }
        if let Some(reply) = reply {
            self.waiters.push(Waiter::Attach(reply));
        }
    }

    pub fn detach(&mut self, conn: &mut ConnectionManager, reply: Reply) {
        if !conn.is_active() {
            let _ = reply.send(Err(conn.state_error()));
            return;
        }
        match self.state {
            ChannelState::Suspended => {
                self.notify_state(ChannelState::Detached, None, AttachFlags::default(), conn);
                let _ = reply.send(Ok(()));
            }
            ChannelState::Detached | ChannelState::Initialized => {
                let _ = reply.send(Ok(()));
            }
            ChannelState::Failed => {
                let _ = reply.send(Err(ErrorInfo::new(
                    codes::CHANNEL_INVALID_STATE,
                    400,
                    "Unable to detach; channel state = failed",
                )));
            }
            ChannelState::Detaching => self.waiters.push(Waiter::Detach(reply)),
            ChannelState::Attaching | ChannelState::Attached => {
                self.request_state(ChannelState::Detaching, None, conn);
                self.waiters.push(Waiter::Detach(reply));
            }
        }
    }

    /// Run `query` once attached, attaching if necessary.
    pub fn presence_get(&mut self, query: PresenceQuery, conn: &mut ConnectionManager, reply: PresenceReply) {
        match self.state {
            ChannelState::Attached => self.presence.get(query, reply),
            ChannelState::Suspended => self.presence.get_while_suspended(query, reply),
            ChannelState::Failed => {
                let _ = reply.send(Err(self.invalid_state_error()));
            }
            _ => {
                if !conn.is_active() {
                    let _ = reply.send(Err(conn.state_error()));
                    return;
                }
                self.attach(conn, None);
                self.waiters.push(Waiter::PresenceGet(query, reply));
            }
        }
    }

    pub fn request_state(
        &mut self,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        conn: &mut ConnectionManager,
    ) {
        self.notify_state(state, reason, AttachFlags::default(), conn);
        self.check_pending_state(conn);
    }

    fn notify_state(
        &mut self,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        attach: AttachFlags,
        conn: &mut ConnectionManager,
    ) {
        self.state_timer.cancel();
        if matches!(
            state,
            ChannelState::Detached | ChannelState::Suspended | ChannelState::Failed
        ) {
            self.properties.channel_serial = None;
        }
        if state == self.state {
            return;
        }

        self.presence.act_on_channel_state(
            state,
            attach.has_presence,
            reason.clone(),
            conn,
            &self.buses.states,
        );

        if state == ChannelState::Suspended && conn.can_send() {
            self.start_retry_timer(conn);
        } else {
            self.retry_timer.cancel();
        }

        if let Some(reason) = &reason {
            self.error_reason = Some(reason.clone());
        }

        let change = ChannelStateChange {
            previous: self.state,
            current: state,
            event: ChannelEvent::State(state),
            resumed: attach.resumed,
            has_backlog: attach.has_backlog,
            reason: reason.clone(),
        };
        if state == ChannelState::Failed {
            error!(channel = %self.name, from = %self.state, to = %state, reason = ?reason, "Channel state changed");
        } else {
            info!(channel = %self.name, from = %self.state, to = %state, resumed = attach.resumed, "Channel state changed");
        }

        if !matches!(state, ChannelState::Attaching | ChannelState::Suspended) {
            self.retry_count = 0;
        }
        if state != ChannelState::Attaching {
            self.last_payload.decode_failure_recovery_in_progress = false;
        }
        match state {
            ChannelState::Attached => self.attach_resume = true,
            ChannelState::Detaching | ChannelState::Failed => self.attach_resume = false,
            _ => {}
        }

        self.state = state;
        self.buses.state.send_replace(state);
        self.buses.states.publish(change);
        self.resolve_waiters(state, reason, conn);
    }

    fn resolve_waiters(&mut self, state: ChannelState, reason: Option<ErrorInfo>, conn: &ConnectionManager) {
        let failure = |op: &str| {
            reason
                .clone()
                .or_else(|| conn.error_reason())
                .unwrap_or_else(|| {
                    ErrorInfo::new(
                        codes::CHANNEL_OPERATION_FAILED,
                        500,
                        format!("Unable to {op}; reason unknown; state = {state}"),
                    )
                })
        };

        for waiter in std::mem::take(&mut self.waiters) {
            match waiter {
                Waiter::Attach(reply) => match state {
                    ChannelState::Attached => {
                        let _ = reply.send(Ok(()));
                    }
                    ChannelState::Detached | ChannelState::Suspended | ChannelState::Failed => {
                        let _ = reply.send(Err(failure("attach")));
                    }
                    ChannelState::Detaching => {
                        let _ = reply.send(Err(superseded(
                            "Attach request superseded by a subsequent detach request",
                        )));
                    }
                    _ => self.waiters.push(Waiter::Attach(reply)),
                },
                Waiter::PresenceGet(query, reply) => match state {
                    ChannelState::Attached => self.presence.get(query, reply),
                    ChannelState::Detached | ChannelState::Suspended | ChannelState::Failed => {
                        let _ = reply.send(Err(failure("attach")));
                    }
                    ChannelState::Detaching => {
                        let _ = reply.send(Err(superseded(
                            "Attach request superseded by a subsequent detach request",
                        )));
                    }
                    _ => self.waiters.push(Waiter::PresenceGet(query, reply)),
                },
                Waiter::Detach(reply) => match state {
                    ChannelState::Detached => {
                        let _ = reply.send(Ok(()));
                    }
                    ChannelState::Attached | ChannelState::Suspended | ChannelState::Failed => {
                        let _ = reply.send(Err(failure("detach")));
                    }
                    ChannelState::Attaching => {
                        let _ = reply.send(Err(superseded(
                            "Detach request superseded by a subsequent attach request",
                        )));
                    }
                    _ => self.waiters.push(Waiter::Detach(reply)),
                },
            }
        }
    }

    /// Send whatever the current transitional state is waiting on.
    pub fn check_pending_state(&mut self, conn: &mut ConnectionManager) {
        if !conn.can_send() {
            debug!(channel = %self.name, state = %self.state, "Connection cannot send; deferring");
            return;
        }
        match self.state {
            ChannelState::Attaching => {
                self.start_state_timer_if_idle(conn);
                self.attach_impl(conn);
            }
            ChannelState::Detaching => {
                self.start_state_timer_if_idle(conn);
                self.detach_impl(conn);
            }
            ChannelState::Attached => self.sync(conn),
            _ => {}
        }
    }

    fn attach_impl(&mut self, conn: &mut ConnectionManager) {
        let mut message = ProtocolMessage::for_channel(Action::Attach, &self.name);
        if !self.options.params.is_empty() {
            message.params = Some(self.options.params.clone());
        }
        let modes = self.options.mode_flags();
        if modes != 0 {
            message.set_flag(modes);
        }
        if self.attach_resume {
            message.set_flag(flags::ATTACH_RESUME);
        }
        message.channel_serial = if self.last_payload.decode_failure_recovery_in_progress {
            self.last_payload.protocol_message_channel_serial.clone()
        } else {
            self.properties.channel_serial.clone()
        };
        debug!(channel = %self.name, serial = ?message.channel_serial, resume = self.attach_resume, "Sending ATTACH");
        let queueable = conn.queue_messages();
        conn.send(message, queueable, Vec::new());
    }

    fn detach_impl(&mut self, conn: &mut ConnectionManager) {
        debug!(channel = %self.name, "Sending DETACH");
        let message = ProtocolMessage::for_channel(Action::Detach, &self.name);
        let queueable = conn.queue_messages();
        conn.send(message, queueable, Vec::new());
    }

    /// Resume a presence sync the server has not finished.
    fn sync(&mut self, conn: &mut ConnectionManager) {
        if !self.presence.members.sync_in_progress() {
            return;
        }
        let mut message = ProtocolMessage::for_channel(Action::Sync, &self.name);
        message.channel_serial = self.sync_channel_serial.clone();
        conn.send(message, false, Vec::new());
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn start_state_timer_if_idle(&mut self, conn: &ConnectionManager) {
        self.state_timer.start_if_idle(
            &self.scheduler,
            TimerOwner::ChannelState(self.name.clone()),
            conn.timeouts().realtime_request(),
        );
    }

    fn start_retry_timer(&mut self, conn: &ConnectionManager) {
        self.retry_count += 1;
        let delay = retry_delay(conn.timeouts().channel_retry(), self.retry_count);
        debug!(channel = %self.name, delay_ms = delay.as_millis() as u64, "Scheduling channel re-attach");
        self.retry_timer.start(
            &self.scheduler,
            TimerOwner::ChannelRetry(self.name.clone()),
            delay,
        );
    }

    pub fn on_state_timer(&mut self, generation: u64, conn: &mut ConnectionManager) {
        if !self.state_timer.claim(generation) {
            return;
        }
        match self.state {
            ChannelState::Attaching => {
                let err = ErrorInfo::new(codes::CHANNEL_TIMEOUT, 408, "Channel attach timed out");
                warn!(channel = %self.name, "Attach timed out");
                self.notify_state(ChannelState::Suspended, Some(err), AttachFlags::default(), conn);
            }
            ChannelState::Detaching => {
                let err = ErrorInfo::new(codes::CHANNEL_TIMEOUT, 408, "Channel detach timed out");
                warn!(channel = %self.name, "Detach timed out");
                self.notify_state(ChannelState::Attached, Some(err), AttachFlags::default(), conn);
            }
            _ => self.check_pending_state(conn),
        }
    }

    pub fn on_retry_timer(&mut self, generation: u64, conn: &mut ConnectionManager) {
        if !self.retry_timer.claim(generation) {
            return;
        }
        if self.state == ChannelState::Suspended && conn.can_send() {
            self.request_state(ChannelState::Attaching, None, conn);
        }
    }

    // -----------------------------------------------------------------------
    // Connection Events
    // -----------------------------------------------------------------------

    pub fn on_transport_active(&mut self, conn: &mut ConnectionManager) {
        match self.state {
            ChannelState::Attaching | ChannelState::Detaching => self.check_pending_state(conn),
            ChannelState::Suspended => self.attach(conn, None),
            ChannelState::Attached => self.request_state(ChannelState::Attaching, None, conn),
            _ => {}
        }
    }

    pub fn on_connection_interrupted(
        &mut self,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        conn: &mut ConnectionManager,
    ) {
        if matches!(
            self.state,
            ChannelState::Attaching
                | ChannelState::Attached
                | ChannelState::Detaching
                | ChannelState::Suspended
        ) {
            self.notify_state(state, reason, AttachFlags::default(), conn);
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub fn process_message(&mut self, message: ProtocolMessage, conn: &mut ConnectionManager) {
        if matches!(
            message.action,
            Action::Attached | Action::Message | Action::Presence
        ) {
            if let Some(serial) = &message.channel_serial {
                self.properties.channel_serial = Some(serial.clone());
            }
        }

        match message.action {
            Action::Attached => self.on_attached(message, conn),
            Action::Detached => {
                let err = message.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_INVALID_STATE, 404, "Channel detached")
                });
                match self.state {
                    ChannelState::Detaching => {
                        self.notify_state(ChannelState::Detached, Some(err), AttachFlags::default(), conn)
                    }
                    ChannelState::Attaching => {
                        self.notify_state(ChannelState::Suspended, Some(err), AttachFlags::default(), conn)
                    }
                    ChannelState::Attached | ChannelState::Suspended => {
                        self.request_state(ChannelState::Attaching, Some(err), conn)
                    }
                    _ => debug!(channel = %self.name, state = %self.state, "Ignoring DETACHED"),
                }
            }
            Action::Sync => {
                self.sync_channel_serial = message.channel_serial.clone();
                if self.on_presence(message, true, conn) {
                    self.sync_channel_serial = None;
                }
            }
            Action::Presence => {
                self.on_presence(message, false, conn);
            }
            Action::Message => self.on_user_messages(message, conn),
            Action::Error => {
                let err = message
                    .error
                    .unwrap_or_else(ErrorInfo::unknown_channel_error);
                if err.code == codes::SUPERSEDED_TRANSPORT {
                    debug!(channel = %self.name, "Operation superseded by transport change; resending");
                    self.check_pending_state(conn);
                } else {
                    self.notify_state(ChannelState::Failed, Some(err), AttachFlags::default(), conn);
                }
            }
            other => warn!(channel = %self.name, action = %other, "Unexpected channel message"),
        }
    }

    fn on_attached(&mut self, message: ProtocolMessage, conn: &mut ConnectionManager) {
        self.properties.attach_serial = message.channel_serial.clone();
        self.properties.modes = ChannelMode::from_flags(message.modes());
        self.properties.params = message.params.clone();
        let attach = AttachFlags {
            resumed: message.has_flag(flags::RESUMED),
            has_presence: message.has_flag(flags::HAS_PRESENCE),
            has_backlog: message.has_flag(flags::HAS_BACKLOG),
        };

        match self.state {
            ChannelState::Attached => {
                if !attach.resumed {
                    self.presence.act_on_channel_state(
                        ChannelState::Attached,
                        attach.has_presence,
                        None,
                        conn,
                        &self.buses.states,
                    );
                }
                if !attach.resumed || self.options.update_on_attached {
                    let mut change =
                        ChannelStateChange::update(self.state, attach.resumed, message.error.clone());
                    change.has_backlog = attach.has_backlog;
                    if let Some(err) = message.error {
                        self.error_reason = Some(err);
                    }
                    self.buses.states.publish(change);
                }
            }
            ChannelState::Detaching => self.check_pending_state(conn),
            _ => self.notify_state(ChannelState::Attached, message.error, attach, conn),
        }
    }

    /// Returns true when a presence sync completed.
    fn on_presence(&mut self, message: ProtocolMessage, is_sync: bool, conn: &ConnectionManager) -> bool {
        let mut items = message.presence.unwrap_or_default();
        for (index, item) in items.iter_mut().enumerate() {
            if item.connection_id.is_empty() {
                item.connection_id = message.connection_id.clone().unwrap_or_default();
            }
            if item.timestamp.is_none() {
                item.timestamp = message.timestamp;
            }
            if item.id.is_none() {
                item.id = message.id.as_ref().map(|id| format!("{id}:{index}"));
            }
            if let Err(e) = self.codec.decode(&mut item.data, &mut item.encoding, &self.options) {
                warn!(channel = %self.name, error = %e, "Unable to decode presence data");
            }
        }
        self.presence.set_presence(
            items,
            is_sync,
            message.channel_serial.as_deref(),
            conn.connection_id(),
        )
    }

    fn on_user_messages(&mut self, message: ProtocolMessage, conn: &mut ConnectionManager) {
        if self.state != ChannelState::Attached {
            info!(channel = %self.name, state = %self.state, "Message arrived on a channel that is not attached; discarding");
            return;
        }
        let mut messages = message.messages.unwrap_or_default();
        let Some(first) = messages.first() else {
            return;
        };

        if let Some(base) = first.delta_base() {
            if self.last_payload.message_id.as_deref() != Some(base) {
                let err = ErrorInfo::new(
                    codes::DELTA_DECODE_FAILED,
                    400,
                    format!(
                        "Delta message decode failure - previous message not available for message \"{}\" on this channel \"{}\"",
                        message.id.as_deref().unwrap_or(""),
                        self.name
                    ),
                );
                error!(channel = %self.name, error = %err, "Delta base mismatch");
                self.start_decode_failure_recovery(err, conn);
                return;
            }
        }

        for (index, item) in messages.iter_mut().enumerate() {
            if item.id.is_none() {
                item.id = message.id.as_ref().map(|id| format!("{id}:{index}"));
            }
            if item.connection_id.is_none() {
                item.connection_id = message.connection_id.clone();
            }
            if item.timestamp.is_none() {
                item.timestamp = message.timestamp;
            }
            if let Err(failure) = self.codec.decode(&mut item.data, &mut item.encoding, &self.options) {
                if failure.needs_recovery() {
                    self.start_decode_failure_recovery(failure.0, conn);
                    return;
                }
                if failure.is_fatal() {
                    self.notify_state(ChannelState::Failed, Some(failure.0), AttachFlags::default(), conn);
                    return;
                }
                warn!(channel = %self.name, error = %failure, "Unable to decode message");
            }
        }

        self.last_payload.message_id = messages.last().and_then(|m| m.id.clone());
        self.last_payload.protocol_message_channel_serial = message.channel_serial;
        for item in messages {
            self.buses.messages.publish(item);
        }
    }

    fn start_decode_failure_recovery(&mut self, reason: ErrorInfo, conn: &mut ConnectionManager) {
        if self.last_payload.decode_failure_recovery_in_progress {
            return;
        }
        warn!(channel = %self.name, error = %reason, "Starting decode failure recovery");
        self.last_payload.decode_failure_recovery_in_progress = true;
        // Forced re-attach, even from attached.
        self.notify_state(ChannelState::Attaching, Some(reason), AttachFlags::default(), conn);
        self.check_pending_state(conn);
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    pub fn publish(&mut self, mut messages: Vec<Message>, conn: &mut ConnectionManager, reply: Reply) {
        if !conn.is_active() {
            let _ = reply.send(Err(conn.state_error()));
            return;
        }
        for message in &mut messages {
            if let Err(err) = self
                .codec
                .encode(&mut message.data, &mut message.encoding, &self.options)
            {
                let _ = reply.send(Err(err));
                return;
            }
        }

        let size: usize = messages.iter().map(Message::size).sum();
        let max = conn.max_message_size();
        if size > max {
            let _ = reply.send(Err(ErrorInfo::new(
                codes::MAX_MESSAGE_SIZE_EXCEEDED,
                400,
                format!(
                    "Maximum size of messages that can be published at once exceeded (was {size} bytes; limit is {max} bytes)"
                ),
            )));
            return;
        }

        if matches!(self.state, ChannelState::Failed | ChannelState::Suspended) {
            let _ = reply.send(Err(self.invalid_state_error()));
            return;
        }

        let mut message = ProtocolMessage::for_channel(Action::Message, &self.name);
        message.messages = Some(messages);
        let queueable = conn.queue_messages();
        conn.send(message, queueable, vec![reply_callback(reply)]);
    }

    pub(crate) fn invalid_state_error(&self) -> ErrorInfo {
        ErrorInfo::new(
            codes::CHANNEL_INVALID_STATE,
            400,
            format!("Channel operation failed as channel state is {}", self.state),
        )
    }

    /// Whether the channel may be dropped from the client.
    pub fn check_releasable(&self) -> Result<(), ErrorInfo> {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed => Ok(()),
            state => Err(ErrorInfo::new(
                codes::CHANNEL_INVALID_STATE,
                400,
                format!("Unable to release channel; channel state = {state}"),
            )),
        }
    }
}

fn superseded(message: &str) -> ErrorInfo {
    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 409, message)
}
