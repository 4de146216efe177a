//! Ordered queue of outbound messages.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, error};

use super::pending::PendingMessage;
use crate::error::ErrorInfo;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum QueueError {
    #[error("acknowledgement for serial {serial} with an empty queue")]
    Empty { serial: u64 },

    #[error("acknowledgement for serial {serial} is ahead of queue head {head}")]
    Gap { serial: u64, head: u64 },
}

#[derive(Default)]
pub(crate) struct MessageQueue {
    messages: VecDeque<PendingMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: PendingMessage) {
        self.messages.push_back(message);
    }

    pub fn shift(&mut self) -> Option<PendingMessage> {
        self.messages.pop_front()
    }

    pub fn last_mut(&mut self) -> Option<&mut PendingMessage> {
        self.messages.back_mut()
    }

    /// Put `messages` ahead of everything queued, keeping their order.
    pub fn prepend(&mut self, messages: Vec<PendingMessage>) {
        for message in messages.into_iter().rev() {
            self.messages.push_front(message);
        }
    }

    pub fn drain(&mut self) -> Vec<PendingMessage> {
        self.messages.drain(..).collect()
    }

    /// Forget serials so messages are renumbered on their next send.
    pub fn reset_send_attempted(&mut self) {
        for message in &mut self.messages {
            message.send_attempted = false;
            message.message.msg_serial = None;
        }
    }

    /// Complete the messages covered by an ACK or NACK of `count` serials
    /// starting at `serial`.
    pub fn complete_messages(
        &mut self,
        serial: u64,
        count: u64,
        result: Result<(), ErrorInfo>,
    ) -> Result<usize, QueueError> {
        let head = match self.messages.front() {
            Some(first) => first.message.msg_serial.unwrap_or(0),
            None => {
                error!(serial, count, "ACK/NACK received with an empty queue");
                return Err(QueueError::Empty { serial });
            }
        };

        if serial > head {
            error!(serial, head, "ACK/NACK serial is ahead of the queue head");
            return Err(QueueError::Gap { serial, head });
        }

        let end = serial.saturating_add(count);
        if end <= head {
            debug!(serial, count, head, "ACK/NACK already processed");
            return Ok(0);
        }

        let completed = ((end - head) as usize).min(self.messages.len());
        for message in self.messages.drain(..completed) {
            message.complete(result.clone());
        }
        Ok(completed)
    }
}
