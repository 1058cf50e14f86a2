//! Turns the transport's one-shot receive call into streams of batches.

pub mod poller;

pub use poller::{EchoResponseBuilder, MessageHandler, MessagePoller, ResponseBuilder};

use crate::config::SubscriberConfig;
use crate::error::{Error, Result};
use crate::message::MessageBatch;
use crate::observability::{Observer, ObserverMetric};
use crate::transport::{ReceiveRequest, Transport, MAX_BATCH_SIZE, MAX_WAIT_SECONDS};
use futures_util::{stream, Stream};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct Subscriber {
    transport: Arc<dyn Transport>,
    queue_url: RwLock<Option<String>>,
    config: SubscriberConfig,
    observer: Arc<dyn Observer>,
}

impl Subscriber {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SubscriberConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            transport,
            queue_url: RwLock::new(None),
            config,
            observer,
        }
    }

    #[must_use]
    pub fn with_queue(self, queue_url: impl Into<String>) -> Self {
        self.set_queue(queue_url);
        self
    }

    /// Point subsequent receive calls at `queue_url`.
    pub fn set_queue(&self, queue_url: impl Into<String>) {
        *self.queue_url.write() = Some(queue_url.into());
    }

    pub fn queue_url(&self) -> Option<String> {
        self.queue_url.read().clone()
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Long-poll wait per receive call. Never zero, so idle loops block in
    /// the transport instead of spinning.
    pub fn long_poll_secs(&self) -> u32 {
        self.config.wait_time_secs.clamp(1, MAX_WAIT_SECONDS)
    }

    /// One long-poll receive against the current queue.
    pub async fn receive(&self, attribute_names: &[String]) -> Result<MessageBatch> {
        self.receive_with(
            attribute_names,
            self.config.max_messages,
            self.long_poll_secs(),
        )
        .await
    }

    async fn receive_with(
        &self,
        attribute_names: &[String],
        max_messages: usize,
        wait_time_secs: u32,
    ) -> Result<MessageBatch> {
        let queue_url = self
            .queue_url()
            .ok_or_else(|| Error::InvalidRequest("subscriber has no queue set".into()))?;

        let request = ReceiveRequest {
            max_messages: max_messages.clamp(1, MAX_BATCH_SIZE),
            attribute_names: attribute_names.to_vec(),
            visibility_timeout_secs: Some(self.config.visibility_timeout_secs),
            wait_time_secs: wait_time_secs.min(MAX_WAIT_SECONDS),
        };
        let raw = self.transport.receive_batch(&queue_url, &request).await?;
        self.observer
            .record_metric(&ObserverMetric::BatchSize(raw.len()));
        Ok(MessageBatch::new(
            Arc::clone(&self.transport),
            queue_url,
            raw,
        ))
    }

    /// Endless stream with one item per receive call. Empty batches are
    /// yielded too, so consumers can do housekeeping when the queue is idle.
    /// Errors are items; the stream keeps going after them.
    pub fn receive_batches(
        &self,
        attribute_names: Vec<String>,
    ) -> impl Stream<Item = Result<MessageBatch>> + Send + '_ {
        stream::unfold(attribute_names, move |names| async move {
            let batch = self.receive(&names).await;
            Some((batch, names))
        })
    }

    /// Micro-batching: merge consecutive receives until `target_count`
    /// messages are held or `time_window` has passed since the first message
    /// arrived. Nothing is yielded while the queue stays empty.
    ///
    /// The window is checked between receive calls; each call's long-poll
    /// wait is shortened to the time left in the window. On a receive error
    /// the error is yielded and any partially accumulated messages are
    /// dropped unacknowledged, to be redelivered by the transport.
    pub fn chunk(
        &self,
        attribute_names: Vec<String>,
        target_count: usize,
        time_window: Duration,
    ) -> impl Stream<Item = Result<MessageBatch>> + Send + '_ {
        let target = target_count.max(1);
        let per_call = self.config.max_messages.min(target);

        stream::unfold(attribute_names, move |names| async move {
            let mut accumulated: Option<MessageBatch> = None;
            let mut window_start: Option<Instant> = None;

            loop {
                let wait = match window_start {
                    Some(start) => {
                        let left = time_window.saturating_sub(start.elapsed());
                        let left_secs = u32::try_from(left.as_secs()).unwrap_or(u32::MAX);
                        let rounded_up = left_secs.saturating_add(u32::from(left.subsec_nanos() > 0));
                        self.long_poll_secs().min(rounded_up)
                    }
                    None => self.long_poll_secs(),
                };

                let batch = match self.receive_with(&names, per_call, wait).await {
                    Ok(batch) => batch,
                    Err(e) => return Some((Err(e), names)),
                };

                if !batch.is_empty() {
                    window_start.get_or_insert_with(Instant::now);
                    match accumulated.as_mut() {
                        Some(acc) => acc.merge(batch),
                        None => accumulated = Some(batch),
                    }
                }

                let full = accumulated.as_ref().is_some_and(|acc| acc.len() >= target);
                let expired = window_start.is_some_and(|start| start.elapsed() >= time_window);
                if full || expired {
                    if let Some(acc) = accumulated.take() {
                        return Some((Ok(acc), names));
                    }
                }
            }
        })
    }
}
