//! Fan-out of drawn messages.

use std::sync::Arc;

use tracing::debug;

use super::{
    msg::{AuthoredMessage, ServerEvent},
    registry::{ConnId, Registry},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLimits {
    pub max_payload_bytes: usize,
    /// Payload the client produces for an untouched canvas.
    pub empty_payload: Option<String>,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 2 * 1024 * 1024,
            empty_payload: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayRejection {
    #[error("payload is empty")]
    Empty,
    #[error("payload is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },
    #[error("sender is not in the room")]
    NotInRoom,
}

#[derive(Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    limits: Arc<RelayLimits>,
}

impl Relay {
    pub fn new(registry: Arc<Registry>, limits: RelayLimits) -> Self {
        Self {
            registry,
            limits: Arc::new(limits),
        }
    }

    pub fn check(&self, payload: &str) -> Result<(), RelayRejection> {
        if payload.trim().is_empty() || self.limits.empty_payload.as_deref() == Some(payload) {
            return Err(RelayRejection::Empty);
        }
        if payload.len() > self.limits.max_payload_bytes {
            return Err(RelayRejection::TooLarge {
                len: payload.len(),
                max: self.limits.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Delivers `payload` to every member but `sender`, stamped with the
    /// sender's registered name. Returns how many outboxes accepted it.
    ///
    /// Deliveries are enqueued in one pass under the registry lock, so two
    /// messages from the same sender reach every recipient in send order.
    pub async fn relay(&self, sender: ConnId, payload: Arc<str>) -> Result<usize, RelayRejection> {
        self.check(&payload)?;

        let members = self.registry.lock().await;
        let user = members
            .name_of(sender)
            .cloned()
            .ok_or(RelayRejection::NotInRoom)?;

        let event = ServerEvent::RecieveMessage(AuthoredMessage {
            user,
            message: payload,
        });
        let recipients = members
            .others(sender)
            .filter(|outbox| outbox.deliver(event.clone()))
            .count();

        debug!(conn = %sender, recipients, "relayed message");
        Ok(recipients)
    }
}
