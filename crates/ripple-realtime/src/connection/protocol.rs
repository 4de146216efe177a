//! A transport paired with the messages it has sent but not had acknowledged.

use tracing::{debug, warn};

use super::pending::PendingMessage;
use super::queue::MessageQueue;
use crate::error::ErrorInfo;
use crate::protocol::ProtocolMessage;
use crate::timers::TimerSlot;
use crate::transport::{Transport, TransportId};

pub(crate) struct Protocol {
    pub id: TransportId,
    transport: Box<dyn Transport>,
    in_flight: MessageQueue,
    pub idle_timer: TimerSlot,
}

impl Protocol {
    pub fn new(id: TransportId, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            in_flight: MessageQueue::new(),
            idle_timer: TimerSlot::default(),
        }
    }

    pub fn kind(&self) -> &str {
        self.transport.kind()
    }

    pub fn send(&mut self, mut pending: PendingMessage) {
        pending.send_attempted = true;
        if let Err(e) = self.transport.send(&pending.message) {
            warn!(id = self.id, error = %e, "Transport rejected outbound message");
        }
        if pending.ack_required {
            self.in_flight.push(pending);
        } else {
            pending.complete(Ok(()));
        }
    }

    /// Send a message that takes no part in acknowledgement.
    pub fn send_control(&mut self, message: &ProtocolMessage) {
        if let Err(e) = self.transport.send(message) {
            debug!(id = self.id, action = %message.action, error = %e, "Unable to send control message");
        }
    }

    pub fn on_ack(&mut self, serial: u64, count: u64) {
        if let Err(e) = self.in_flight.complete_messages(serial, count, Ok(())) {
            warn!(id = self.id, error = %e, "Ignoring ACK");
        }
    }

    pub fn on_nack(&mut self, serial: u64, count: u64, error: Option<ErrorInfo>) {
        let error = error.unwrap_or_else(ErrorInfo::nack_default);
        warn!(id = self.id, serial, count, error = %error, "Messages rejected by server");
        if let Err(e) = self.in_flight.complete_messages(serial, count, Err(error)) {
            warn!(id = self.id, error = %e, "Ignoring NACK");
        }
    }

    pub fn take_pending(&mut self) -> Vec<PendingMessage> {
        self.in_flight.drain()
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Superseded by a newer transport; kept only until acks drain.
    pub fn finish(&mut self) {
        self.idle_timer.cancel();
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn disconnect(&mut self, error: Option<ErrorInfo>) {
        self.idle_timer.cancel();
        self.transport.disconnect(error);
    }

    pub fn dispose(&mut self) {
        self.idle_timer.cancel();
        self.transport.dispose();
    }
}
