//! Leaderless garbage collection of abandoned reply queues.
//!
//! Every process that owns a reply queue also runs a sweeper against one
//! shared FIFO queue named `<prefix>sweeper.fifo`. On a clock-aligned
//! schedule each sweeper publishes a `SweepingTrigger` sentinel; transport
//! deduplication collapses the copies from concurrent processes. Whoever
//! receives the trigger lists every queue under the prefix and publishes one
//! check message per queue. Whoever receives a check message reads that
//! queue's `heartbeat` tag and deletes the queue once the heartbeat is older
//! than the idle retention period.

use crate::config::{MissingHeartbeatPolicy, SubscriberConfig, SweeperConfig};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::observability::{Observer, ObserverEvent};
use crate::subscriber::poller::sleep_or_cancel;
use crate::subscriber::Subscriber;
use crate::transport::{attribute, SendRequest, Transport};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Queue tag holding the owner's last liveness signal, in unix seconds.
pub const HEARTBEAT_TAG: &str = "heartbeat";
/// Body of the sentinel message that starts a fan-out.
pub const SWEEPING_TRIGGER: &str = "SweepingTrigger";
const SWEEPER_QUEUE_SUFFIX: &str = "sweeper.fifo";

/// Tags carrying a fresh heartbeat.
pub fn heartbeat_tags() -> HashMap<String, String> {
    HashMap::from([(
        HEARTBEAT_TAG.to_string(),
        Utc::now().timestamp().to_string(),
    )])
}

pub fn sweeper_queue_name(prefix: &str) -> String {
    format!("{prefix}{SWEEPER_QUEUE_SUFFIX}")
}

fn dedup_id(scope: &str) -> String {
    hex::encode(Sha256::digest(scope.as_bytes()))
}

fn queue_name_from_url(queue_url: &str) -> &str {
    queue_url.rsplit('/').next().unwrap_or(queue_url)
}

/// Shared sweeper queues of any prefix, including nested ones like
/// `svc_a_sweeper.fifo` under `svc_`. They carry no heartbeat.
fn is_sweeper_queue(queue_url: &str) -> bool {
    queue_name_from_url(queue_url).ends_with(SWEEPER_QUEUE_SUFFIX)
}

/// What a single check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Alive,
    Deleted,
    /// Someone else deleted it first.
    AlreadyGone,
    /// No readable heartbeat and the policy says leave it.
    Skipped,
    /// A sweeper queue, this one's or another prefix's; never touched.
    Ignored,
}

/// Protocol logic shared by the background loops and the manual entry
/// points. Cheap to clone into tasks.
#[derive(Clone)]
struct SweepWorker {
    transport: Arc<dyn Transport>,
    subscriber: Arc<Subscriber>,
    config: SweeperConfig,
    observer: Arc<dyn Observer>,
    prefix: String,
    address: String,
}

impl SweepWorker {
    fn current_slot(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        now / self.config.trigger_interval_secs.max(1)
    }

    async fn publish_trigger(&self, dedup_scope: &str) -> Result<()> {
        self.transport
            .send(
                &self.address,
                SendRequest {
                    body: SWEEPING_TRIGGER.to_string(),
                    group_id: Some(SWEEPING_TRIGGER.to_string()),
                    deduplication_id: Some(dedup_id(dedup_scope)),
                    ..SendRequest::default()
                },
            )
            .await?;
        self.observer.record_event(&ObserverEvent::SweepTriggered {
            sweeper: self.address.clone(),
        });
        Ok(())
    }

    async fn scheduled_trigger(&self) -> Result<()> {
        let slot = self.current_slot();
        self.publish_trigger(&format!("{slot}:{SWEEPING_TRIGGER}"))
            .await
    }

    /// Publish one check message per prefix-matching queue. Returns the
    /// number of queues published.
    async fn fan_out(&self) -> Result<usize> {
        let slot = self.current_slot();
        let mut published = 0;
        let mut page_token = None;

        loop {
            let page = self
                .transport
                .list_queues(&self.prefix, self.config.list_queues_max_results, page_token)
                .await?;

            for queue_url in page.queue_urls.iter().filter(|url| !is_sweeper_queue(url)) {
                self.transport
                    .send(
                        &self.address,
                        SendRequest {
                            body: queue_url.clone(),
                            group_id: Some(queue_name_from_url(queue_url).to_string()),
                            deduplication_id: Some(dedup_id(&format!("{slot}:{queue_url}"))),
                            ..SendRequest::default()
                        },
                    )
                    .await?;
                published += 1;
            }

            match page.next_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::debug!(prefix = %self.prefix, published, "Sweep fan-out published");
        Ok(published)
    }

    async fn check(&self, queue_url: &str) -> Result<CheckOutcome> {
        if is_sweeper_queue(queue_url) {
            return Ok(CheckOutcome::Ignored);
        }

        let tags = match self.transport.get_queue_tags(queue_url).await {
            Ok(tags) => tags,
            Err(e) if e.is_queue_not_found() => return Ok(CheckOutcome::AlreadyGone),
            Err(e) => return Err(e),
        };

        let heartbeat = tags.get(HEARTBEAT_TAG).and_then(|v| v.trim().parse::<i64>().ok());
        let idle = match heartbeat {
            Some(last) => {
                let age = Utc::now().timestamp().saturating_sub(last);
                age > i64::try_from(self.config.idle_queue_retention_secs).unwrap_or(i64::MAX)
            }
            None => match self.config.missing_heartbeat {
                MissingHeartbeatPolicy::Skip => {
                    tracing::warn!(
                        queue = %queue_url,
                        "Queue has no readable heartbeat tag; leaving it alone"
                    );
                    return Ok(CheckOutcome::Skipped);
                }
                MissingHeartbeatPolicy::Delete => true,
            },
        };
        if !idle {
            return Ok(CheckOutcome::Alive);
        }

        let depth = self.transport.get_queue_depth(queue_url).await.unwrap_or(0);
        match self.transport.delete_queue(queue_url).await {
            Ok(()) => {
                self.observer.record_event(&ObserverEvent::QueueSwept {
                    address: queue_url.to_string(),
                    depth,
                });
                Ok(CheckOutcome::Deleted)
            }
            Err(e) if e.is_queue_not_found() => Ok(CheckOutcome::AlreadyGone),
            Err(e) => Err(e),
        }
    }

    async fn handle(&self, message: &Message) -> Result<()> {
        if message.body == SWEEPING_TRIGGER {
            self.fan_out().await?;
        } else {
            self.check(&message.body).await?;
        }
        Ok(())
    }

    /// One receive call's worth of work. Every message is acknowledged,
    /// whatever happened to it.
    async fn sweep_once(&self) -> Result<usize> {
        let mut batch = self.subscriber.receive(&[]).await?;
        let mut processed = 0;
        while let Some(message) = batch.next_message() {
            if let Err(e) = self.handle(&message).await {
                tracing::warn!(
                    sweeper = %self.address,
                    body = %message.body,
                    error = %e,
                    "Sweep step failed"
                );
                self.observer.record_event(&ObserverEvent::Error {
                    component: "sweeper".into(),
                    message: e.to_string(),
                });
            }
            processed += 1;
        }
        batch.acknowledge().await?;
        Ok(processed)
    }

    async fn run_sweep_loop(self, token: CancellationToken) {
        let backoff = self.subscriber.config().error_backoff();
        loop {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => break,
                result = self.sweep_once() => result,
            };
            if let Err(e) = result {
                if e.is_queue_not_found() && token.is_cancelled() {
                    break;
                }
                tracing::warn!(sweeper = %self.address, error = %e, "Sweep receive failed");
                self.observer.record_event(&ObserverEvent::Error {
                    component: "sweeper".into(),
                    message: e.to_string(),
                });
                if sleep_or_cancel(backoff, &token).await {
                    break;
                }
            }
        }
        tracing::debug!(sweeper = %self.address, "Sweep loop stopped");
    }

    async fn run_trigger_loop(self, token: CancellationToken) {
        let interval_ms = self.config.trigger_interval_secs.max(1).saturating_mul(1000);
        loop {
            let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
            let until_next_slot = Duration::from_millis(interval_ms - now_ms % interval_ms);
            if sleep_or_cancel(until_next_slot, &token).await {
                break;
            }
            if let Err(e) = self.scheduled_trigger().await {
                tracing::warn!(sweeper = %self.address, error = %e, "Failed to publish sweep trigger");
                self.observer.record_event(&ObserverEvent::Error {
                    component: "sweeper".into(),
                    message: e.to_string(),
                });
            }
        }
        tracing::debug!(sweeper = %self.address, "Trigger loop stopped");
    }
}

struct Running {
    worker: SweepWorker,
    token: CancellationToken,
    trigger: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

/// Background sweeper bound to one logical name prefix.
pub struct IdleQueueSweeper {
    transport: Arc<dyn Transport>,
    config: SweeperConfig,
    subscriber_config: SubscriberConfig,
    observer: Arc<dyn Observer>,
    running: tokio::sync::Mutex<Option<Running>>,
    address: parking_lot::RwLock<Option<String>>,
    root: CancellationToken,
}

impl IdleQueueSweeper {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SweeperConfig,
        subscriber_config: SubscriberConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            transport,
            config,
            subscriber_config,
            observer,
            running: tokio::sync::Mutex::new(None),
            address: parking_lot::RwLock::new(None),
            root: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.address.read().is_some()
    }

    /// Address of the shared sweeper queue while running.
    pub fn address(&self) -> Option<String> {
        self.address.read().clone()
    }

    /// Create (or join) the shared sweeper queue for `prefix` and start the
    /// trigger and sweep loops. Starting a running sweeper returns its
    /// current address.
    pub async fn start(&self, prefix: &str) -> Result<String> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if current.worker.prefix != prefix {
                tracing::warn!(
                    running = %current.worker.prefix,
                    requested = %prefix,
                    "Sweeper already running for another prefix"
                );
            }
            return Ok(current.worker.address.clone());
        }

        let address = self.ensure_queue(prefix).await?;
        let subscriber = Arc::new(
            Subscriber::new(
                Arc::clone(&self.transport),
                self.subscriber_config.clone(),
                Arc::clone(&self.observer),
            )
            .with_queue(&address),
        );
        let worker = SweepWorker {
            transport: Arc::clone(&self.transport),
            subscriber,
            config: self.config.clone(),
            observer: Arc::clone(&self.observer),
            prefix: prefix.to_string(),
            address: address.clone(),
        };

        let token = self.root.child_token();
        let trigger = tokio::spawn(worker.clone().run_trigger_loop(token.clone()));
        let sweep = tokio::spawn(worker.clone().run_sweep_loop(token.clone()));

        tracing::info!(sweeper = %address, prefix = %prefix, "Idle queue sweeper started");
        *self.address.write() = Some(address.clone());
        *running = Some(Running {
            worker,
            token,
            trigger,
            sweep,
        });
        Ok(address)
    }

    async fn ensure_queue(&self, prefix: &str) -> Result<String> {
        let name = sweeper_queue_name(prefix);
        let attributes = HashMap::from([
            (attribute::FIFO_QUEUE.to_string(), "true".to_string()),
            (
                attribute::CONTENT_BASED_DEDUPLICATION.to_string(),
                "true".to_string(),
            ),
        ]);
        match self
            .transport
            .create_queue(&name, &attributes, &HashMap::new())
            .await
        {
            Ok(address) => {
                self.observer
                    .record_event(&ObserverEvent::QueueCreated {
                        address: address.clone(),
                    });
                Ok(address)
            }
            Err(e) if e.is_queue_already_exists() => self.transport.get_queue_url(&name).await,
            Err(e) => Err(e),
        }
    }

    /// Stop both loops and wait for them. The shared queue stays; other
    /// processes may still be using it. No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.address.write().take();
        running.token.cancel();
        for (name, handle) in [("trigger", running.trigger), ("sweep", running.sweep)] {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, "Sweeper task ended abnormally: {e}");
            }
        }
        tracing::info!(sweeper = %running.worker.address, "Idle queue sweeper stopped");
    }

    /// Publish a trigger now instead of waiting for the next slot.
    pub async fn trigger_now(&self) -> Result<()> {
        let worker = self.worker().await?;
        worker
            .publish_trigger(&format!("manual:{}", Uuid::new_v4()))
            .await
    }

    /// Process one receive call from the sweeper queue on the caller's task.
    pub async fn sweep_once(&self) -> Result<usize> {
        self.worker().await?.sweep_once().await
    }

    /// Run the idle check for one queue right away.
    pub async fn check_queue(&self, queue_url: &str) -> Result<CheckOutcome> {
        self.worker().await?.check(queue_url).await
    }

    async fn worker(&self) -> Result<SweepWorker> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.worker.clone())
            .ok_or_else(|| Error::InvalidRequest("idle queue sweeper is not running".into()))
    }
}

impl Drop for IdleQueueSweeper {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl fmt::Debug for IdleQueueSweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleQueueSweeper")
            .field("address", &self.address())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::testing::{CapturedLogs, RecordingObserver};
    use crate::observability::LogObserver;
    use crate::transport::InMemoryTransport;

    const PREFIX: &str = "reply_queue_";

    fn sweeper(transport: &Arc<InMemoryTransport>, observer: Arc<RecordingObserver>) -> IdleQueueSweeper {
        IdleQueueSweeper::new(
            transport.clone(),
            SweeperConfig {
                trigger_interval_secs: 3600,
                ..SweeperConfig::default()
            },
            SubscriberConfig {
                wait_time_secs: 1,
                ..SubscriberConfig::default()
            },
            observer,
        )
    }

    async fn queue_with_heartbeat(
        transport: &InMemoryTransport,
        name: &str,
        heartbeat: Option<i64>,
    ) -> String {
        let tags = heartbeat
            .map(|ts| HashMap::from([(HEARTBEAT_TAG.to_string(), ts.to_string())]))
            .unwrap_or_default();
        transport
            .create_queue(name, &HashMap::new(), &tags)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn start_creates_fifo_queue_and_is_idempotent() {
        let transport = Arc::new(InMemoryTransport::new());
        let sweeper = sweeper(&transport, Arc::default());

        let address = sweeper.start(PREFIX).await.unwrap();
        assert_eq!(address, "memory://queues/reply_queue_sweeper.fifo");
        assert!(sweeper.is_running());
        assert_eq!(sweeper.start(PREFIX).await.unwrap(), address);

        sweeper.stop().await;
        assert!(!sweeper.is_running());
        assert!(transport.queue_exists(&address));
    }

    #[tokio::test]
    async fn second_process_joins_existing_sweeper_queue() {
        let transport = Arc::new(InMemoryTransport::new());
        let first = sweeper(&transport, Arc::default());
        let second = sweeper(&transport, Arc::default());

        let a = first.start(PREFIX).await.unwrap();
        let b = second.start(PREFIX).await.unwrap();
        assert_eq!(a, b);
        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn check_deletes_only_idle_queues() {
        let transport = Arc::new(InMemoryTransport::new());
        let observer = Arc::new(RecordingObserver::default());
        let sweeper = sweeper(&transport, observer.clone());
        let own = sweeper.start(PREFIX).await.unwrap();

        let now = Utc::now().timestamp();
        let stale = queue_with_heartbeat(&transport, "reply_queue_stale", Some(now - 600)).await;
        let fresh = queue_with_heartbeat(&transport, "reply_queue_fresh", Some(now)).await;

        assert_eq!(sweeper.check_queue(&stale).await.unwrap(), CheckOutcome::Deleted);
        assert_eq!(sweeper.check_queue(&fresh).await.unwrap(), CheckOutcome::Alive);
        assert_eq!(sweeper.check_queue(&own).await.unwrap(), CheckOutcome::Ignored);
        assert_eq!(sweeper.check_queue(&stale).await.unwrap(), CheckOutcome::AlreadyGone);

        assert!(!transport.queue_exists(&stale));
        assert!(transport.queue_exists(&fresh));
        assert!(observer.kinds().contains(&"queue_swept"));
        sweeper.stop().await;
    }

    #[tokio::test]
    async fn missing_heartbeat_follows_policy() {
        let transport = Arc::new(InMemoryTransport::new());
        let skip = sweeper(&transport, Arc::default());
        skip.start(PREFIX).await.unwrap();
        let untagged = queue_with_heartbeat(&transport, "reply_queue_untagged", None).await;
        assert_eq!(skip.check_queue(&untagged).await.unwrap(), CheckOutcome::Skipped);
        skip.stop().await;

        let delete = IdleQueueSweeper::new(
            transport.clone(),
            SweeperConfig {
                missing_heartbeat: MissingHeartbeatPolicy::Delete,
                trigger_interval_secs: 3600,
                ..SweeperConfig::default()
            },
            SubscriberConfig {
                wait_time_secs: 1,
                ..SubscriberConfig::default()
            },
            Arc::new(RecordingObserver::default()),
        );
        delete.start(PREFIX).await.unwrap();
        assert_eq!(delete.check_queue(&untagged).await.unwrap(), CheckOutcome::Deleted);
        delete.stop().await;
    }

    #[tokio::test]
    async fn duplicate_triggers_in_one_slot_collapse() {
        let transport = Arc::new(InMemoryTransport::new());
        let sweeper = sweeper(&transport, Arc::default());
        let address = sweeper.start(PREFIX).await.unwrap();
        // Stop the background consumer so the queue contents stay observable.
        let worker = sweeper.worker().await.unwrap();
        sweeper.stop().await;

        worker.scheduled_trigger().await.unwrap();
        worker.scheduled_trigger().await.unwrap();
        assert_eq!(transport.message_count(&address), 1);
    }

    #[tokio::test]
    async fn fan_out_publishes_every_prefix_queue_but_its_own() {
        let transport = Arc::new(InMemoryTransport::new());
        let sweeper = IdleQueueSweeper::new(
            transport.clone(),
            SweeperConfig {
                list_queues_max_results: 2,
                ..SweeperConfig::default()
            },
            SubscriberConfig::default(),
            Arc::new(RecordingObserver::default()),
        );
        let address = sweeper.start(PREFIX).await.unwrap();
        let worker = sweeper.worker().await.unwrap();
        sweeper.stop().await;

        for name in ["reply_queue_a", "reply_queue_b", "reply_queue_c", "unrelated"] {
            queue_with_heartbeat(&transport, name, Some(0)).await;
        }
        assert_eq!(worker.fan_out().await.unwrap(), 3);
        assert_eq!(transport.message_count(&address), 3);
    }

    #[tokio::test]
    async fn nested_prefix_sweeper_queues_are_never_checked_or_deleted() {
        let transport = Arc::new(InMemoryTransport::new());
        let inner = sweeper(&transport, Arc::default());
        let inner_address = inner.start("svc_a_").await.unwrap();

        let outer = IdleQueueSweeper::new(
            transport.clone(),
            SweeperConfig {
                missing_heartbeat: MissingHeartbeatPolicy::Delete,
                trigger_interval_secs: 3600,
                ..SweeperConfig::default()
            },
            SubscriberConfig {
                wait_time_secs: 1,
                ..SubscriberConfig::default()
            },
            Arc::new(RecordingObserver::default()),
        );
        let outer_address = outer.start("svc_").await.unwrap();
        let worker = outer.worker().await.unwrap();
        outer.stop().await;

        assert_eq!(
            worker.check(&inner_address).await.unwrap(),
            CheckOutcome::Ignored
        );
        assert!(transport.queue_exists(&inner_address));

        queue_with_heartbeat(&transport, "svc_a_reply", Some(0)).await;
        assert_eq!(worker.fan_out().await.unwrap(), 1);
        assert_eq!(transport.message_count(&outer_address), 1);
        inner.stop().await;
    }

    #[tokio::test]
    async fn swept_queue_is_logged_once_with_log_backend() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();

        let transport = Arc::new(InMemoryTransport::new());
        let sweeper = IdleQueueSweeper::new(
            transport.clone(),
            SweeperConfig {
                trigger_interval_secs: 3600,
                ..SweeperConfig::default()
            },
            SubscriberConfig {
                wait_time_secs: 1,
                ..SubscriberConfig::default()
            },
            Arc::new(LogObserver::new()),
        );
        sweeper.start(PREFIX).await.unwrap();
        let stale = queue_with_heartbeat(&transport, "reply_queue_stale", Some(0)).await;

        assert_eq!(sweeper.check_queue(&stale).await.unwrap(), CheckOutcome::Deleted);
        sweeper.stop().await;
        assert_eq!(logs.count(&stale), 1);
        assert_eq!(logs.count("idle queue swept"), 1);
    }

    #[tokio::test]
    async fn operations_require_running_sweeper() {
        let transport = Arc::new(InMemoryTransport::new());
        let sweeper = sweeper(&transport, Arc::default());
        assert!(sweeper.trigger_now().await.is_err());
        sweeper.stop().await;
    }

    #[test]
    fn group_id_is_the_queue_name() {
        assert_eq!(
            queue_name_from_url("https://sqs.us-east-1.amazonaws.com/123/reply_queue_x"),
            "reply_queue_x"
        );
        assert_eq!(sweeper_queue_name("svc_"), "svc_sweeper.fifo");
        assert!(is_sweeper_queue("memory://queues/svc_a_sweeper.fifo"));
        assert!(!is_sweeper_queue("memory://queues/svc_a_1f3c"));
    }
}
