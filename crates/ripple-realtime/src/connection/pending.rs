//! Outbound messages awaiting transmission or acknowledgement.

use std::collections::HashSet;

use crate::error::ErrorInfo;
use crate::protocol::{Action, ProtocolMessage};

/// Completion for an outbound message.
pub type SendCallback = Box<dyn FnOnce(Result<(), ErrorInfo>) + Send + 'static>;

pub(crate) struct PendingMessage {
    pub message: ProtocolMessage,
    callbacks: Vec<SendCallback>,
    /// Other queued messages were folded into this one.
    pub merged: bool,
    /// Has been written to a transport at least once; keeps its serial.
    pub send_attempted: bool,
    pub ack_required: bool,
}

impl PendingMessage {
    pub fn new(message: ProtocolMessage, callbacks: Vec<SendCallback>) -> Self {
        let ack_required = message.action.is_ack_required();
        Self {
            message,
            callbacks,
            merged: false,
            send_attempted: false,
            ack_required,
        }
    }

    pub fn complete(self, result: Result<(), ErrorInfo>) {
        for callback in self.callbacks {
            callback(result.clone());
        }
    }

    /// Fold `other` into this message if the two can travel as one.
    ///
    /// Returns `other` untouched when they cannot.
    pub fn try_bundle(
        &mut self,
        other: PendingMessage,
        max_size: usize,
    ) -> Result<(), PendingMessage> {
        if self.send_attempted || !can_bundle(&self.message, &other.message, max_size) {
            return Err(other);
        }

        let PendingMessage {
            message, callbacks, ..
        } = other;
        match self.message.action {
            Action::Message => self
                .message
                .messages
                .get_or_insert_with(Vec::new)
                .extend(message.messages.unwrap_or_default()),
            _ => self
                .message
                .presence
                .get_or_insert_with(Vec::new)
                .extend(message.presence.unwrap_or_default()),
        }
        self.callbacks.extend(callbacks);
        self.merged = true;
        Ok(())
    }
}

impl std::fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("action", &self.message.action)
            .field("channel", &self.message.channel)
            .field("msg_serial", &self.message.msg_serial)
            .field("callbacks", &self.callbacks.len())
            .field("merged", &self.merged)
            .field("send_attempted", &self.send_attempted)
            .finish()
    }
}

fn can_bundle(dest: &ProtocolMessage, src: &ProtocolMessage, max_size: usize) -> bool {
    if dest.channel != src.channel || dest.action != src.action {
        return false;
    }
    let (client_ids, ids): (Vec<Option<&str>>, Vec<bool>) = match dest.action {
        Action::Message => dest
            .messages
            .iter()
            .chain(src.messages.iter())
            .flatten()
            .map(|m| (m.client_id.as_deref(), m.id.is_some()))
            .unzip(),
        Action::Presence => dest
            .presence
            .iter()
            .chain(src.presence.iter())
            .flatten()
            .map(|p| (Some(p.client_id.as_str()), p.id.is_some()))
            .unzip(),
        _ => return false,
    };

    if dest.payload_size() + src.payload_size() > max_size {
        return false;
    }
    if client_ids.iter().collect::<HashSet<_>>().len() > 1 {
        return false;
    }
    !ids.into_iter().any(|has_id| has_id)
}
