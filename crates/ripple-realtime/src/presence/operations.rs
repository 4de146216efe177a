//! Entering, updating and leaving presence on behalf of this client.

use serde_json::Value;
use tracing::debug;

use crate::channel::{reply_callback, ChannelState, RealtimeChannel, Reply};
use crate::connection::ConnectionManager;
use crate::error::{codes, ErrorInfo};
use crate::protocol::{Action, PresenceAction, PresenceMessage, ProtocolMessage};

impl RealtimeChannel {
    /// Enter, update or leave as `client_id`, or as this connection's own
    /// client id when none is given.
    pub fn update_presence(
        &mut self,
        action: PresenceAction,
        client_id: Option<String>,
        data: Option<Value>,
        conn: &mut ConnectionManager,
        reply: Reply,
    ) {
        let client_id = client_id.or_else(|| conn.client_id().map(str::to_string));
        let Some(client_id) = client_id.filter(|id| !id.is_empty() && id != "*") else {
            let _ = reply.send(Err(ErrorInfo::new(
                codes::CLIENT_ID_REQUIRED,
                400,
                "clientId must be specified to enter a presence channel",
            )));
            return;
        };
        if !conn.is_active() {
            let _ = reply.send(Err(conn.state_error()));
            return;
        }

        let mut presence = PresenceMessage::new(action, client_id);
        presence.data = data;
        if let Err(err) = self
            .codec
            .encode(&mut presence.data, &mut presence.encoding, &self.options)
        {
            let _ = reply.send(Err(err));
            return;
        }

        debug!(channel = %self.name, action = %action, client_id = %presence.client_id, state = %self.state, "Presence operation");
        match action {
            PresenceAction::Leave => self.leave(presence, conn, reply),
            _ => self.enter_or_update(presence, conn, reply),
        }
    }

    fn enter_or_update(&mut self, presence: PresenceMessage, conn: &mut ConnectionManager, reply: Reply) {
        match self.state {
            ChannelState::Attached => self.send_presence(presence, conn, reply),
            ChannelState::Initialized | ChannelState::Detached => {
                self.attach(conn, None);
                self.presence.queue(presence, reply_callback(reply));
            }
            ChannelState::Attaching => self.presence.queue(presence, reply_callback(reply)),
            state => {
                let _ = reply.send(Err(ErrorInfo::new(
                    codes::CHANNEL_INVALID_STATE,
                    400,
                    format!(
                        "Unable to {} presence channel while in {state} state",
                        presence.action
                    ),
                )));
            }
        }
    }

    fn leave(&mut self, presence: PresenceMessage, conn: &mut ConnectionManager, reply: Reply) {
        match self.state {
            ChannelState::Attached => self.send_presence(presence, conn, reply),
            ChannelState::Attaching => self.presence.queue(presence, reply_callback(reply)),
            ChannelState::Initialized | ChannelState::Failed => {
                let _ = reply.send(Err(ErrorInfo::new(
                    codes::CHANNEL_INVALID_STATE,
                    400,
                    "Unable to leave presence channel (incompatible state)",
                )));
            }
            _ => {
                let _ = reply.send(Err(self.invalid_state_error()));
            }
        }
    }

    fn send_presence(&mut self, presence: PresenceMessage, conn: &mut ConnectionManager, reply: Reply) {
        let mut message = ProtocolMessage::for_channel(Action::Presence, &self.name);
        message.presence = Some(vec![presence]);
        let queueable = conn.queue_messages();
        conn.send(message, queueable, vec![reply_callback(reply)]);
    }
}
