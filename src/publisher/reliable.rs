use super::outbox::Outbox;
use super::traits::{Delivery, Publisher};
use crate::config::ReliabilityConfig;
use crate::error::{Error, Result};
use crate::message::RequestMessage;
use crate::observability::{Observer, ObserverEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Publisher decorator: fixed-backoff retries, then the outbox.
///
/// Only retryable errors (transport outages) earn another attempt. Once the
/// attempts are spent, or on the first non-retryable error, the message is
/// handed to the outbox; if there is no outbox or it fails too, the caller
/// gets [`Error::DeliveryFailed`].
pub struct RetryingPublisher {
    inner: Arc<dyn Publisher>,
    outbox: Option<Arc<dyn Outbox>>,
    attempts: u32,
    backoff: Duration,
    observer: Arc<dyn Observer>,
}

impl RetryingPublisher {
    pub fn new(
        inner: Arc<dyn Publisher>,
        attempts: u32,
        backoff: Duration,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            inner,
            outbox: None,
            attempts: attempts.max(1),
            backoff,
            observer,
        }
    }

    pub fn from_config(
        inner: Arc<dyn Publisher>,
        config: &ReliabilityConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self::new(
            inner,
            config.publish_retries,
            Duration::from_millis(config.publish_backoff_ms),
            observer,
        )
    }

    #[must_use]
    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    fn delivery_failed(&self, message: &RequestMessage, reason: String) -> Error {
        self.observer.record_event(&ObserverEvent::DeliveryFailed {
            message_id: message.id().to_string(),
            destination: message.destination().to_string(),
        });
        Error::DeliveryFailed {
            message_id: message.id().to_string(),
            destination: message.destination().to_string(),
            reason,
        }
    }
}

#[async_trait]
impl Publisher for RetryingPublisher {
    async fn send(&self, message: &RequestMessage) -> Result<Delivery> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match self.inner.send(message).await {
                Ok(delivery) => {
                    if attempt > 1 {
                        tracing::info!(
                            request_id = %message.id(),
                            attempt,
                            "Publish recovered after retry"
                        );
                    }
                    return Ok(delivery);
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    tracing::warn!(
                        request_id = %message.id(),
                        destination = %message.destination(),
                        attempt,
                        max_attempts = self.attempts,
                        retryable,
                        error = %e,
                        "Publish attempt failed"
                    );
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        let reason = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        let Some(outbox) = &self.outbox else {
            return Err(self.delivery_failed(message, reason));
        };

        match outbox.create(message).await {
            Ok(()) => {
                tracing::debug!(
                    request_id = %message.id(),
                    destination = %message.destination(),
                    "Message written to outbox after publish failure: {reason}"
                );
                self.observer.record_event(&ObserverEvent::OutboxFallback {
                    message_id: message.id().to_string(),
                });
                Ok(Delivery::Outboxed)
            }
            Err(e) => {
                let outbox_err = Error::OutboxWriteFailed {
                    message_id: message.id().to_string(),
                    reason: format!("{e:#}"),
                };
                tracing::error!(request_id = %message.id(), "{outbox_err}");
                Err(self.delivery_failed(message, format!("{reason}; {outbox_err}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::testing::RecordingObserver;
    use crate::observability::NoopObserver;
    use crate::publisher::MemoryOutbox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockPublisher {
        calls: Arc<AtomicUsize>,
        fail_until_attempt: usize,
        retryable: bool,
    }

    #[async_trait]
    impl Publisher for MockPublisher {
        async fn send(&self, _message: &RequestMessage) -> Result<Delivery> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_until_attempt {
                return Err(if self.retryable {
                    Error::TransportUnavailable("connection reset".into())
                } else {
                    Error::InvalidRequest("body too large".into())
                });
            }
            Ok(Delivery::Queued {
                message_id: format!("msg-{attempt}"),
            })
        }
    }

    struct FailingOutbox;

    #[async_trait]
    impl Outbox for FailingOutbox {
        async fn create(&self, _message: &RequestMessage) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn publisher(calls: &Arc<AtomicUsize>, fail_until_attempt: usize, retryable: bool) -> RetryingPublisher {
        RetryingPublisher::new(
            Arc::new(MockPublisher {
                calls: Arc::clone(calls),
                fail_until_attempt,
                retryable,
            }),
            3,
            Duration::from_millis(1),
            Arc::new(NoopObserver),
        )
    }

    fn message() -> RequestMessage {
        RequestMessage::new("hello", "memory://queues/q")
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let delivery = publisher(&calls, 0, true).send(&message()).await.unwrap();
        assert_eq!(delivery.message_id(), Some("msg-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let delivery = publisher(&calls, 2, true).send(&message()).await.unwrap();
        assert_eq!(delivery.message_id(), Some("msg-3"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn falls_back_to_outbox_after_retries_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let outbox = Arc::new(MemoryOutbox::new());
        let msg = message();
        let delivery = publisher(&calls, usize::MAX, true)
            .with_outbox(outbox.clone())
            .send(&msg)
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Outboxed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outbox.records()[0].id, msg.id());
    }

    #[tokio::test]
    async fn delivery_failed_without_outbox() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = publisher(&calls, usize::MAX, true)
            .send(&message())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { .. }));
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn delivery_failed_when_outbox_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = Arc::new(RecordingObserver::default());
        let publisher = RetryingPublisher::new(
            Arc::new(MockPublisher {
                calls: Arc::clone(&calls),
                fail_until_attempt: usize::MAX,
                retryable: true,
            }),
            3,
            Duration::from_millis(1),
            observer.clone(),
        )
        .with_outbox(Arc::new(FailingOutbox));

        let err = publisher.send(&message()).await.unwrap_err();
        match err {
            Error::DeliveryFailed { reason, .. } => assert!(reason.contains("disk full")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(observer.kinds(), vec!["delivery_failed"]);
    }

    #[tokio::test]
    async fn skips_retries_on_non_retryable_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let outbox = Arc::new(MemoryOutbox::new());
        let delivery = publisher(&calls, usize::MAX, false)
            .with_outbox(outbox.clone())
            .send(&message())
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Outboxed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = RetryingPublisher::new(
            Arc::new(MockPublisher {
                calls,
                fail_until_attempt: 0,
                retryable: true,
            }),
            0,
            Duration::ZERO,
            Arc::new(NoopObserver),
        );
        assert_eq!(p.attempts, 1);
    }
}
