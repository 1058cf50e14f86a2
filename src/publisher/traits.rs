use crate::error::Result;
use crate::message::RequestMessage;
use async_trait::async_trait;

/// How a publish attempt ended up being recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the transport.
    Queued { message_id: String },
    /// The transport was unreachable; the message went to the outbox instead.
    Outboxed,
}

impl Delivery {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Queued { message_id } => Some(message_id),
            Self::Outboxed => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// Sends request messages to the destination each message names.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send(&self, message: &RequestMessage) -> Result<Delivery>;
}
