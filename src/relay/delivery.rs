use std::sync::Arc;
use tracing::debug;

use super::registry::ClientRegistry;
use crate::mqtt::{InboundMessage, MessageHandler};

/// Fans every inbound message out to all registered sessions
///
/// Only enqueues; it never touches a socket and never waits.
pub struct DeliveryRelay {
    registry: Arc<ClientRegistry>,
}

impl DeliveryRelay {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Renders and enqueues `message`; returns how many sessions took it
    pub fn relay(&self, message: &InboundMessage) -> usize {
        self.broadcast(message.render())
    }

    pub fn broadcast(&self, line: String) -> usize {
        let sessions = self.registry.snapshot();
        let mut delivered = 0;
        for session in &sessions {
            if session.enqueue(line.clone()) {
                delivered += 1;
            } else {
                // Session is on its way out and will unregister itself
                debug!("Skipping session {} with closed queue", session.id());
            }
        }
        debug!("Relayed line to {}/{} sessions", delivered, sessions.len());
        delivered
    }
}

impl MessageHandler for DeliveryRelay {
    fn on_message(&self, message: &InboundMessage) {
        self.relay(message);
    }
}
