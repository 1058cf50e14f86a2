//! Responder side of the request/reply protocol.

use super::Subscriber;
use crate::error::{Error, Result};
use crate::message::{Message, MessageBatch, RequestMessage, REPLY_TO, REQUEST_MESSAGE_ID};
use crate::observability::{Observer, ObserverEvent};
use crate::publisher::Publisher;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Application logic run for every received message.
///
/// `Ok(Some(text))` with non-empty text is sent back when the message names a
/// reply address. An `Err` leaves the message unacknowledged so the transport
/// redelivers it after its visibility timeout.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process(&self, message: &Message) -> anyhow::Result<Option<String>>;
}

/// Builds the reply for a handled request.
pub trait ResponseBuilder: Send + Sync {
    fn build(&self, request: &Message, response: String, reply_address: &str) -> RequestMessage;
}

/// Reply body is the handler response; the request's correlation id is
/// echoed back.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponseBuilder;

impl ResponseBuilder for EchoResponseBuilder {
    fn build(&self, request: &Message, response: String, reply_address: &str) -> RequestMessage {
        let reply = RequestMessage::new(response, reply_address);
        match request.correlation_id() {
            Some(id) => reply.with_attribute(REQUEST_MESSAGE_ID, id),
            None => reply,
        }
    }
}

pub struct MessagePoller {
    subscriber: Arc<Subscriber>,
    handler: Arc<dyn MessageHandler>,
    publisher: Arc<dyn Publisher>,
    response_builder: Arc<dyn ResponseBuilder>,
    observer: Arc<dyn Observer>,
}

impl MessagePoller {
    pub fn new(
        subscriber: Arc<Subscriber>,
        handler: Arc<dyn MessageHandler>,
        publisher: Arc<dyn Publisher>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            subscriber,
            handler,
            publisher,
            response_builder: Arc::new(EchoResponseBuilder),
            observer,
        }
    }

    #[must_use]
    pub fn with_response_builder(mut self, builder: Arc<dyn ResponseBuilder>) -> Self {
        self.response_builder = builder;
        self
    }

    fn attribute_names() -> Vec<String> {
        vec![REQUEST_MESSAGE_ID.to_string(), REPLY_TO.to_string()]
    }

    /// Poll until `shutdown` is cancelled. Receive errors are logged and
    /// retried after the subscriber's error backoff.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let backoff = self.subscriber.config().error_backoff();
        let batches = self.subscriber.receive_batches(Self::attribute_names());
        tokio::pin!(batches);

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = batches.next() => next,
            };

            match next {
                Some(Ok(mut batch)) => {
                    self.process_batch(&mut batch).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Receive failed; backing off");
                    self.observer.record_event(&ObserverEvent::Error {
                        component: "poller".into(),
                        message: e.to_string(),
                    });
                    if sleep_or_cancel(backoff, &shutdown).await {
                        break;
                    }
                }
                None => break,
            }
        }

        tracing::debug!("Message poller stopped");
        Ok(())
    }

    /// Run on the runtime until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Receive and process a single batch. Returns how many messages were
    /// handled successfully.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut batch = self.subscriber.receive(&Self::attribute_names()).await?;
        Ok(self.process_batch(&mut batch).await)
    }

    async fn process_batch(&self, batch: &mut MessageBatch) -> usize {
        let mut handled = 0;

        while let Some(message) = batch.next_message() {
            match self.handler.process(&message).await {
                Ok(response) => {
                    handled += 1;
                    let Some(response) = response.filter(|r| !r.is_empty()) else {
                        continue;
                    };
                    if let Some(address) = message.reply_address() {
                        self.reply(&message, response, address).await;
                    }
                }
                Err(e) => {
                    let failure = Error::HandlerFailure {
                        message_id: message.id.clone(),
                        reason: format!("{e:#}"),
                    };
                    tracing::debug!(error = %failure, "Discarding message from batch");
                    self.observer.record_event(&ObserverEvent::HandlerFailed {
                        message_id: message.id.clone(),
                        reason: failure.to_string(),
                    });
                    batch.discard(&message.id);
                }
            }
        }

        if let Err(e) = batch.acknowledge().await {
            tracing::warn!(queue = %batch.queue_url(), error = %e, "Failed to acknowledge batch");
        }
        handled
    }

    async fn reply(&self, request: &Message, response: String, address: &str) {
        let reply = self.response_builder.build(request, response, address);
        if let Err(e) = self.publisher.send(&reply).await {
            tracing::error!(
                message_id = %request.id,
                reply_to = %address,
                error = %e,
                "Failed to send reply"
            );
        }
    }
}

/// Returns `true` when cancelled before `duration` elapsed.
pub(crate) async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}
