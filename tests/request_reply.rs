//! End-to-end request/reply through the public API.
//!
//! A producer publishes requests carrying a reply queue; a responder runs a
//! `MessagePoller` over the request queue; the producer collects replies by
//! correlation id. Everything runs against `InMemoryTransport`.

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use replyqueue::config::{Config, ReliabilityConfig, SubscriberConfig};
use replyqueue::observability::NoopObserver;
use replyqueue::publisher::{create_publisher, Delivery, MemoryOutbox, QueuePublisher};
use replyqueue::{
    Error, InMemoryTransport, Message, MessageHandler, MessagePoller, Observer, Publisher,
    ReplyQueue, ReplyQueueState, RequestMessage, RetryingPublisher, Subscriber, Transport,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

struct PongHandler;

#[async_trait]
impl MessageHandler for PongHandler {
    async fn process(&self, message: &Message) -> anyhow::Result<Option<String>> {
        Ok(Some(format!("{}-pong", message.body)))
    }
}

/// Fails the first delivery of every message, succeeds afterwards.
#[derive(Default)]
struct FlakyHandler {
    seen: Mutex<HashSet<String>>,
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn process(&self, message: &Message) -> anyhow::Result<Option<String>> {
        if self.seen.lock().insert(message.id.clone()) {
            bail!("first attempt always fails");
        }
        Ok(Some(format!("{}-retried", message.body)))
    }
}

fn observer() -> Arc<dyn Observer> {
    Arc::new(NoopObserver)
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.subscriber.wait_time_secs = 1;
    config.sweeper.enabled = false;
    config
}

struct Harness {
    transport: Arc<InMemoryTransport>,
    requests: String,
    publisher: Arc<dyn Publisher>,
    reply_queue: Arc<ReplyQueue>,
    shutdown: CancellationToken,
    responder: JoinHandle<replyqueue::Result<()>>,
}

impl Harness {
    async fn start(handler: Arc<dyn MessageHandler>, subscriber_config: SubscriberConfig) -> Self {
        let config = fast_config();
        let transport = Arc::new(InMemoryTransport::new());
        let requests = transport
            .create_queue("requests", &HashMap::new(), &HashMap::new())
            .await
            .unwrap();
        let publisher = create_publisher(
            transport.clone(),
            &config.reliability,
            None,
            observer(),
        );

        let subscriber = Arc::new(
            Subscriber::new(transport.clone(), subscriber_config, observer()).with_queue(&requests),
        );
        let poller = Arc::new(MessagePoller::new(
            subscriber,
            handler,
            publisher.clone(),
            observer(),
        ));
        let shutdown = CancellationToken::new();
        let responder = poller.spawn(shutdown.clone());

        let reply_queue = Arc::new(ReplyQueue::from_config(transport.clone(), &config, observer()));

        Self {
            transport,
            requests,
            publisher,
            reply_queue,
            shutdown,
            responder,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.responder.await.unwrap().unwrap();
        self.reply_queue.teardown().await.unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Round trips
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_gets_ping_pong() {
    let subscriber_config = fast_config().subscriber;
    let harness = Harness::start(Arc::new(PongHandler), subscriber_config).await;

    let request = RequestMessage::new("ping", &harness.requests)
        .with_reply_to(harness.reply_queue.clone());
    let delivery = harness.publisher.send(&request).await.unwrap();
    assert!(delivery.is_queued());

    let reply = request.get_response(Duration::from_secs(5)).await.unwrap();
    assert_eq!(reply.body, "ping-pong");
    assert_eq!(reply.correlation_id(), Some(request.id()));
    assert_eq!(harness.reply_queue.state(), ReplyQueueState::Active);

    let address = harness.reply_queue.current_address().unwrap();
    let transport = harness.transport.clone();
    harness.stop().await;
    assert!(!transport.queue_exists(&address));
}

#[tokio::test]
async fn concurrent_requests_are_correlated_independently() {
    let subscriber_config = fast_config().subscriber;
    let harness = Harness::start(Arc::new(PongHandler), subscriber_config).await;

    let mut waits = Vec::new();
    for i in 0..20 {
        let request = RequestMessage::new(format!("req-{i}"), &harness.requests)
            .with_reply_to(harness.reply_queue.clone());
        harness.publisher.send(&request).await.unwrap();
        waits.push(tokio::spawn(async move {
            let reply = request.get_response(Duration::from_secs(10)).await?;
            Ok::<_, Error>((request.body().to_string(), reply.body))
        }));
    }

    for wait in waits {
        let (sent, received) = wait.await.unwrap().unwrap();
        assert_eq!(received, format!("{sent}-pong"));
    }
    assert_eq!(harness.reply_queue.pending_replies(), 20);
    harness.stop().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let transport = Arc::new(InMemoryTransport::new());
    let requests = transport
        .create_queue("nobody_listens", &HashMap::new(), &HashMap::new())
        .await
        .unwrap();
    let reply_queue = Arc::new(ReplyQueue::from_config(
        transport.clone(),
        &fast_config(),
        observer(),
    ));
    let publisher = QueuePublisher::new(transport.clone(), observer());

    let request = RequestMessage::new("hello?", &requests).with_reply_to(reply_queue.clone());
    publisher.send(&request).await.unwrap();

    let err = request
        .get_response(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.is_reply_timeout());
    assert_eq!(transport.message_count(&requests), 1);
    reply_queue.teardown().await.unwrap();
}

#[tokio::test]
async fn failed_handler_gets_redelivery() {
    let subscriber_config = SubscriberConfig {
        wait_time_secs: 1,
        visibility_timeout_secs: 1,
        ..SubscriberConfig::default()
    };
    let harness = Harness::start(Arc::new(FlakyHandler::default()), subscriber_config).await;

    let request = RequestMessage::new("job", &harness.requests)
        .with_reply_to(harness.reply_queue.clone());
    harness.publisher.send(&request).await.unwrap();

    let reply = request.get_response(Duration::from_secs(10)).await.unwrap();
    assert_eq!(reply.body, "job-retried");
    harness.stop().await;
}

#[tokio::test]
async fn torn_down_reply_queue_refuses_new_requests() {
    let subscriber_config = fast_config().subscriber;
    let harness = Harness::start(Arc::new(PongHandler), subscriber_config).await;
    harness.reply_queue.address().await.unwrap();
    harness.reply_queue.teardown().await.unwrap();

    let request = RequestMessage::new("late", &harness.requests)
        .with_reply_to(harness.reply_queue.clone());
    let err = harness.publisher.send(&request).await.unwrap_err();
    assert!(matches!(err, Error::DeliveryFailed { .. }), "{err}");
    assert_eq!(harness.transport.message_count(&harness.requests), 0);
    harness.stop().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Delivery fallback
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn outage_falls_back_to_outbox() {
    let transport = Arc::new(InMemoryTransport::new());
    let requests = transport
        .create_queue("requests", &HashMap::new(), &HashMap::new())
        .await
        .unwrap();
    let outbox = Arc::new(MemoryOutbox::new());
    let publisher = RetryingPublisher::new(
        Arc::new(QueuePublisher::new(transport.clone(), observer())),
        3,
        Duration::from_millis(5),
        observer(),
    )
    .with_outbox(outbox.clone());

    transport.set_available(false);
    let request = RequestMessage::new("important", &requests);
    let delivery = publisher.send(&request).await.unwrap();

    assert_eq!(delivery, Delivery::Outboxed);
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox.records()[0].id, request.id());
}

#[tokio::test]
async fn outage_without_outbox_is_delivery_failure() {
    let transport = Arc::new(InMemoryTransport::new());
    let requests = transport
        .create_queue("requests", &HashMap::new(), &HashMap::new())
        .await
        .unwrap();
    let config = ReliabilityConfig {
        publish_retries: 2,
        publish_backoff_ms: 1,
    };
    let publisher = create_publisher(transport.clone(), &config, None, observer());

    transport.set_available(false);
    let err = publisher
        .send(&RequestMessage::new("lost", &requests))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeliveryFailed { .. }));
    assert!(!err.is_retryable());
}
