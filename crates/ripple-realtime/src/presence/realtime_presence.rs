use std::sync::LazyLock;

use regex::Regex;
use ripple_common::EventBus;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::map::{now_millis, synthesized_leave, MemberKey, PresenceMap, PresenceQuery};
use crate::channel::{ChannelState, ChannelStateChange};
use crate::connection::{ConnectionManager, SendCallback};
use crate::error::{codes, ErrorInfo};
use crate::protocol::{Action, PresenceAction, PresenceMessage, ProtocolMessage};

/// `<serial>:<cursor>`; an empty cursor means the sync is complete.
static SYNC_CURSOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w-]+:(.*)$").expect("presence: static regex pattern must compile"));

pub(crate) type PresenceReply = oneshot::Sender<Result<Vec<PresenceMessage>, ErrorInfo>>;

struct PendingPresence {
    presence: PresenceMessage,
    callback: SendCallback,
}

pub(crate) struct RealtimePresence {
    channel: String,
    pub members: PresenceMap,
    pub my_members: PresenceMap,
    pending: Vec<PendingPresence>,
    sync_waiters: Vec<(PresenceQuery, PresenceReply)>,
    events: EventBus<PresenceMessage>,
}

impl RealtimePresence {
    pub fn new(channel: &str, events: EventBus<PresenceMessage>) -> Self {
        Self {
            channel: channel.to_string(),
            members: PresenceMap::new(MemberKey::Member),
            my_members: PresenceMap::new(MemberKey::ClientId),
            pending: Vec::new(),
            sync_waiters: Vec::new(),
            events,
        }
    }

    pub fn rebind(&mut self, events: EventBus<PresenceMessage>) {
        self.events = events;
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Apply presence from a PRESENCE or SYNC message. Returns true when a
    /// sync completed.
    pub fn set_presence(
        &mut self,
        items: Vec<PresenceMessage>,
        is_sync: bool,
        sync_channel_serial: Option<&str>,
        connection_id: Option<&str>,
    ) -> bool {
        let mut sync_cursor = None;
        if is_sync {
            self.members.start_sync();
            sync_cursor = sync_channel_serial
                .and_then(|serial| SYNC_CURSOR.captures(serial))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .filter(|cursor| !cursor.is_empty());
        }

        let mut broadcast = Vec::new();
        for item in items {
            let own = connection_id.is_some_and(|id| id == item.connection_id);
            match item.action {
                PresenceAction::Leave => {
                    if own && !item.is_synthesized() {
                        self.my_members.remove(&item);
                    }
                    if self.members.remove(&item) {
                        broadcast.push(item);
                    }
                }
                PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                    if own {
                        self.my_members.put(item.clone());
                    }
                    if self.members.put(item.clone()) {
                        broadcast.push(item);
                    }
                }
                PresenceAction::Absent => {}
            }
        }

        let mut sync_ended = false;
        if is_sync && sync_cursor.is_none() {
            let leaves = self.members.end_sync();
            self.publish_all(leaves);
            self.resolve_sync_waiters();
            sync_ended = true;
        }
        self.publish_all(broadcast);
        sync_ended
    }

    fn publish_all(&self, messages: Vec<PresenceMessage>) {
        for message in messages {
            self.events.publish(message);
        }
    }

    // -----------------------------------------------------------------------
    // Channel State
    // -----------------------------------------------------------------------

    pub fn act_on_channel_state(
        &mut self,
        state: ChannelState,
        has_presence: bool,
        reason: Option<ErrorInfo>,
        conn: &mut ConnectionManager,
        channel_events: &EventBus<ChannelStateChange>,
    ) {
        match state {
            ChannelState::Attached => self.on_attached(has_presence, conn, channel_events),
            ChannelState::Detached | ChannelState::Failed => {
                self.my_members.clear();
                self.members.clear();
                let err = reason.unwrap_or_else(|| state_change_error(state));
                self.fail_pending(err.clone());
                self.fail_sync_waiters(err);
            }
            ChannelState::Suspended => {
                let err = reason.unwrap_or_else(|| state_change_error(state));
                self.fail_pending(err);
                self.fail_sync_waiters(out_of_sync());
            }
            _ => {}
        }
    }

    fn on_attached(
        &mut self,
        has_presence: bool,
        conn: &mut ConnectionManager,
        channel_events: &EventBus<ChannelStateChange>,
    ) {
        debug!(channel = %self.channel, has_presence, "Presence attached");
        if has_presence {
            self.members.start_sync();
        } else {
            let now = now_millis();
            let leaves: Vec<_> = self
                .members
                .values()
                .iter()
                .map(|m| synthesized_leave(m, now))
                .collect();
            self.members.clear();
            self.publish_all(leaves);
            self.resolve_sync_waiters();
        }

        for member in self.my_members.values() {
            let mut enter = PresenceMessage::new(PresenceAction::Enter, member.client_id.clone());
            enter.id = member.id.clone();
            enter.data = member.data.clone();
            enter.encoding = member.encoding.clone();

            let channel = self.channel.clone();
            let client_id = member.client_id.clone();
            let events = channel_events.clone();
            let callback: SendCallback = Box::new(move |result| {
                if let Err(cause) = result {
                    let reason = ErrorInfo::new(
                        codes::PRESENCE_REENTER_FAILED,
                        cause.status_code,
                        format!("Presence auto re-enter failed for {client_id}"),
                    )
                    .with_cause(cause);
                    warn!(channel = %channel, error = %reason, "Presence re-enter failed");
                    events.publish(ChannelStateChange::update(
                        ChannelState::Attached,
                        true,
                        Some(reason),
                    ));
                }
            });
            self.pending.push(PendingPresence {
                presence: enter,
                callback,
            });
        }

        self.send_pending(conn);
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    pub fn queue(&mut self, presence: PresenceMessage, callback: SendCallback) {
        self.pending.push(PendingPresence { presence, callback });
    }

    /// Send every queued operation as one PRESENCE message.
    pub fn send_pending(&mut self, conn: &mut ConnectionManager) {
        if self.pending.is_empty() {
            return;
        }
        info!(channel = %self.channel, count = self.pending.len(), "Sending queued presence");
        let (presence, callbacks): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .map(|p| (p.presence, p.callback))
            .unzip();
        let mut message = ProtocolMessage::for_channel(Action::Presence, &self.channel);
        message.presence = Some(presence);
        let queueable = conn.queue_messages();
        conn.send(message, queueable, callbacks);
    }

    fn fail_pending(&mut self, error: ErrorInfo) {
        for pending in self.pending.drain(..) {
            (pending.callback)(Err(error.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Answer a query against an attached channel.
    pub fn get(&mut self, query: PresenceQuery, reply: PresenceReply) {
        if query.wait_for_sync && self.members.sync_in_progress() {
            self.sync_waiters.push((query, reply));
        } else {
            let _ = reply.send(Ok(self.members.list(&query)));
        }
    }

    /// Answer a query against a suspended channel.
    pub fn get_while_suspended(&self, query: PresenceQuery, reply: PresenceReply) {
        let result = if query.wait_for_sync {
            Err(out_of_sync())
        } else {
            Ok(self.members.list(&query))
        };
        let _ = reply.send(result);
    }

    fn resolve_sync_waiters(&mut self) {
        for (query, reply) in self.sync_waiters.drain(..) {
            let _ = reply.send(Ok(self.members.list(&query)));
        }
    }

    fn fail_sync_waiters(&mut self, error: ErrorInfo) {
        for (_, reply) in self.sync_waiters.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }
    }
}

fn out_of_sync() -> ErrorInfo {
    ErrorInfo::new(
        codes::PRESENCE_OUT_OF_SYNC,
        400,
        "Presence state is out of sync due to channel being in the SUSPENDED state",
    )
}

fn state_change_error(state: ChannelState) -> ErrorInfo {
    ErrorInfo::new(
        codes::CHANNEL_INVALID_STATE,
        400,
        format!("Presence operation abandoned; channel {state}"),
    )
}
