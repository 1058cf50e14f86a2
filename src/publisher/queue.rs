use super::traits::{Delivery, Publisher};
use crate::error::Result;
use crate::message::RequestMessage;
use crate::observability::{Observer, ObserverEvent};
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;

/// One transport send per call, no retry. Errors propagate unchanged.
pub struct QueuePublisher {
    transport: Arc<dyn Transport>,
    observer: Arc<dyn Observer>,
}

impl QueuePublisher {
    pub fn new(transport: Arc<dyn Transport>, observer: Arc<dyn Observer>) -> Self {
        Self {
            transport,
            observer,
        }
    }
}

#[async_trait]
impl Publisher for QueuePublisher {
    async fn send(&self, message: &RequestMessage) -> Result<Delivery> {
        let request = message.to_send_request().await?;
        let message_id = self.transport.send(message.destination(), request).await?;

        tracing::debug!(
            destination = %message.destination(),
            request_id = %message.id(),
            message_id = %message_id,
            "Published message"
        );
        self.observer.record_event(&ObserverEvent::MessagePublished {
            destination: message.destination().to_string(),
            message_id: message_id.clone(),
        });
        Ok(Delivery::Queued { message_id })
    }
}
