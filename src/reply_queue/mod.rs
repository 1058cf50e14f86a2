//! Ephemeral reply inbox and the correlation engine behind request/reply.
//!
//! A [`ReplyQueue`] creates its transport queue lazily on the first
//! [`address`](ReplyQueue::address) call. From then on a subscription loop
//! stores every reply in a [`CorrelationTable`] keyed by `RequestMessageId`,
//! a heartbeat loop keeps the queue's `heartbeat` tag fresh, and an optional
//! [`IdleQueueSweeper`] reclaims queues whose owners died without tearing
//! down.

pub mod correlation;

pub use correlation::CorrelationTable;

use crate::config::{Config, ReplyQueueConfig, SubscriberConfig};
use crate::error::{Error, Result};
use crate::message::{Message, MessageBatch, REQUEST_MESSAGE_ID};
use crate::observability::{Observer, ObserverEvent, ObserverMetric};
use crate::subscriber::poller::sleep_or_cancel;
use crate::subscriber::Subscriber;
use crate::sweeper::{heartbeat_tags, IdleQueueSweeper};
use crate::transport::{attribute, Transport};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyQueueState {
    Uninitialized,
    Active,
    /// Terminal.
    TornDown,
}

struct ActiveQueue {
    address: String,
    token: CancellationToken,
    subscription: JoinHandle<Result<()>>,
    heartbeat: JoinHandle<()>,
}

enum Lifecycle {
    Uninitialized,
    Active(ActiveQueue),
    TornDown,
}

pub struct ReplyQueue {
    local_id: String,
    name: String,
    transport: Arc<dyn Transport>,
    subscriber: Arc<Subscriber>,
    sweeper: Option<Arc<IdleQueueSweeper>>,
    config: ReplyQueueConfig,
    observer: Arc<dyn Observer>,
    table: Arc<CorrelationTable>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    state: RwLock<ReplyQueueState>,
    address: RwLock<Option<String>>,
    created_at: DateTime<Utc>,
    shutdown: CancellationToken,
}

impl ReplyQueue {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ReplyQueueConfig,
        subscriber_config: SubscriberConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let subscriber = Arc::new(Subscriber::new(
            Arc::clone(&transport),
            subscriber_config,
            Arc::clone(&observer),
        ));
        Self {
            local_id: Uuid::new_v4().simple().to_string(),
            name: config.name.clone(),
            transport,
            subscriber,
            sweeper: None,
            config,
            observer,
            table: Arc::new(CorrelationTable::new()),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Uninitialized),
            state: RwLock::new(ReplyQueueState::Uninitialized),
            address: RwLock::new(None),
            created_at: Utc::now(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build from a full [`Config`], attaching a sweeper when
    /// `sweeper.enabled` is set.
    pub fn from_config(
        transport: Arc<dyn Transport>,
        config: &Config,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let queue = Self::new(
            Arc::clone(&transport),
            config.reply_queue.clone(),
            config.subscriber.clone(),
            Arc::clone(&observer),
        );
        if !config.sweeper.enabled {
            return queue;
        }
        let sweeper = IdleQueueSweeper::new(
            transport,
            config.sweeper.clone(),
            config.subscriber.clone(),
            observer,
        );
        queue.with_sweeper(Arc::new(sweeper))
    }

    #[must_use]
    pub fn with_sweeper(mut self, sweeper: Arc<IdleQueueSweeper>) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn state(&self) -> ReplyQueueState {
        *self.state.read()
    }

    /// Address if the queue has been created and not torn down. Never
    /// creates anything.
    pub fn current_address(&self) -> Option<String> {
        self.address.read().clone()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Logical name, shared by every reply queue of the same service.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn physical_name(&self) -> String {
        format!("{}{}", self.name, self.local_id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Replies stored and not yet aged out.
    pub fn pending_replies(&self) -> usize {
        self.table.len()
    }

    pub fn default_response_timeout(&self) -> Duration {
        self.config.default_response_timeout()
    }

    pub fn sweeper(&self) -> Option<&Arc<IdleQueueSweeper>> {
        self.sweeper.as_ref()
    }

    /// Transport address of this inbox. The first call creates the queue
    /// and starts the background loops.
    pub async fn address(&self) -> Result<String> {
        if let Some(address) = self.current_address() {
            return Ok(address);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Active(active) => return Ok(active.address.clone()),
            Lifecycle::TornDown => {
                return Err(Error::ReplyQueueClosed {
                    name: self.physical_name(),
                })
            }
            Lifecycle::Uninitialized => {}
        }

        let active = self.activate().await?;
        let address = active.address.clone();
        *lifecycle = Lifecycle::Active(active);
        *self.state.write() = ReplyQueueState::Active;
        *self.address.write() = Some(address.clone());
        Ok(address)
    }

    async fn activate(&self) -> Result<ActiveQueue> {
        let attributes = HashMap::from([(
            attribute::MESSAGE_RETENTION_PERIOD.to_string(),
            self.config.queue_message_retention_secs.to_string(),
        )]);
        let address = self
            .transport
            .create_queue(&self.physical_name(), &attributes, &heartbeat_tags())
            .await?;
        self.observer.record_event(&ObserverEvent::QueueCreated {
            address: address.clone(),
        });

        self.subscriber.set_queue(&address);
        let token = self.shutdown.child_token();

        let subscription = Subscription {
            subscriber: Arc::clone(&self.subscriber),
            table: Arc::clone(&self.table),
            observer: Arc::clone(&self.observer),
            messages_before_cleaning: self.config.messages_before_cleaning.max(1),
            reply_max_age: self.config.reply_max_age(),
            address: address.clone(),
        };
        let subscription = tokio::spawn(subscription.run(token.clone()));

        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&self.transport),
            Arc::clone(&self.observer),
            address.clone(),
            self.config.heartbeat_interval(),
            token.clone(),
        ));

        if let Some(sweeper) = &self.sweeper {
            if let Err(e) = sweeper.start(&self.name).await {
                tracing::warn!(name = %self.name, error = %e, "Idle queue sweeper failed to start");
                self.observer.record_event(&ObserverEvent::Error {
                    component: "sweeper".into(),
                    message: e.to_string(),
                });
            }
        }

        Ok(ActiveQueue {
            address,
            token,
            subscription,
            heartbeat,
        })
    }

    /// Wait up to `timeout` for the reply correlated with `correlation_id`.
    ///
    /// Only reads the correlation table, which is checked every
    /// `response_poll_interval_ms`. The reply stays in the table until it
    /// ages out, so asking twice returns it twice.
    pub async fn get_response(&self, correlation_id: &str, timeout: Duration) -> Result<Message> {
        let started = Instant::now();
        let deadline = started + timeout;
        let poll_interval = self.config.response_poll_interval();

        loop {
            if let Some(message) = self.table.get(correlation_id) {
                self.observer
                    .record_metric(&ObserverMetric::ReplyLatency(started.elapsed()));
                return Ok(message);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }

        tracing::debug!(correlation_id, ?timeout, "Timed out waiting for reply");
        self.observer.record_event(&ObserverEvent::ReplyTimeout {
            correlation_id: correlation_id.to_string(),
        });
        Err(Error::ReplyTimeout {
            correlation_id: correlation_id.to_string(),
            timeout_ms: timeout.as_millis(),
        })
    }

    /// Stop the loops and the sweeper, then delete the queue. A no-op unless
    /// the queue is active; after it the queue cannot be used again.
    pub async fn teardown(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let active = match std::mem::replace(&mut *lifecycle, Lifecycle::TornDown) {
            Lifecycle::Active(active) => active,
            other => {
                *lifecycle = other;
                return Ok(());
            }
        };
        *self.state.write() = ReplyQueueState::TornDown;
        self.address.write().take();

        active.token.cancel();
        match active.subscription.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(queue = %active.address, error = %e, "Subscription loop had failed"),
            Err(e) => tracing::warn!(queue = %active.address, "Subscription task ended abnormally: {e}"),
        }
        if let Err(e) = active.heartbeat.await {
            tracing::warn!(queue = %active.address, "Heartbeat task ended abnormally: {e}");
        }
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop().await;
        }

        match self.transport.delete_queue(&active.address).await {
            Ok(()) => {}
            Err(e) if e.is_queue_not_found() => {
                tracing::debug!(queue = %active.address, "Reply queue already gone");
            }
            Err(e) => return Err(e),
        }
        tracing::debug!(queue = %active.address, "Reply queue torn down");
        self.observer.record_event(&ObserverEvent::QueueDeleted {
            address: active.address,
        });
        Ok(())
    }
}

impl Drop for ReplyQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for ReplyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyQueue")
            .field("name", &self.name)
            .field("local_id", &self.local_id)
            .field("state", &self.state())
            .field("address", &self.current_address())
            .field("pending_replies", &self.pending_replies())
            .finish_non_exhaustive()
    }
}

/// Receive side of an active reply queue, moved into its own task.
struct Subscription {
    subscriber: Arc<Subscriber>,
    table: Arc<CorrelationTable>,
    observer: Arc<dyn Observer>,
    messages_before_cleaning: usize,
    reply_max_age: Duration,
    address: String,
}

impl Subscription {
    async fn run(self, token: CancellationToken) -> Result<()> {
        let names = vec![REQUEST_MESSAGE_ID.to_string()];
        let backoff = self.subscriber.config().error_backoff();
        let mut stored_since_sweep = 0;
        let mut last_sweep = Instant::now();

        loop {
            let received = tokio::select! {
                biased;
                () = token.cancelled() => break,
                received = self.subscriber.receive(&names) => received,
            };

            match received {
                Ok(mut batch) => {
                    let drained = batch.is_empty();
                    stored_since_sweep += self.store(&mut batch);
                    if let Err(e) = batch.acknowledge().await {
                        tracing::warn!(queue = %self.address, error = %e, "Failed to acknowledge replies");
                    }
                    if drained
                        || stored_since_sweep >= self.messages_before_cleaning
                        || last_sweep.elapsed() >= self.reply_max_age
                    {
                        self.age_out();
                        stored_since_sweep = 0;
                        last_sweep = Instant::now();
                    }
                }
                Err(e) if e.is_queue_not_found() => {
                    if token.is_cancelled() {
                        break;
                    }
                    tracing::error!(queue = %self.address, "Reply queue disappeared while active");
                    self.observer.record_event(&ObserverEvent::Error {
                        component: "reply_queue".into(),
                        message: e.to_string(),
                    });
                    // Nothing left to heartbeat either.
                    token.cancel();
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(queue = %self.address, error = %e, "Reply receive failed; backing off");
                    self.observer.record_event(&ObserverEvent::Error {
                        component: "reply_queue".into(),
                        message: e.to_string(),
                    });
                    if sleep_or_cancel(backoff, &token).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(queue = %self.address, "Subscription loop stopped");
        Ok(())
    }

    fn store(&self, batch: &mut MessageBatch) -> usize {
        let mut stored = 0;
        while let Some(message) = batch.next_message() {
            let Some(correlation_id) = message
                .correlation_id()
                .filter(|id| !id.is_empty())
                .map(str::to_string)
            else {
                tracing::debug!(message_id = %message.id, "Dropping reply without correlation id");
                continue;
            };
            self.table.upsert(correlation_id, message);
            stored += 1;
        }
        if stored > 0 {
            self.observer
                .record_event(&ObserverEvent::RepliesStored { count: stored });
            self.observer
                .record_metric(&ObserverMetric::CorrelationTableSize(self.table.len()));
        }
        stored
    }

    fn age_out(&self) {
        let evicted = self.table.evict_older_than(self.reply_max_age);
        if evicted > 0 {
            tracing::debug!(queue = %self.address, evicted, "Aged out uncollected replies");
            self.observer
                .record_event(&ObserverEvent::RepliesEvicted { count: evicted });
            self.observer
                .record_metric(&ObserverMetric::CorrelationTableSize(self.table.len()));
        }
    }
}

async fn run_heartbeat(
    transport: Arc<dyn Transport>,
    observer: Arc<dyn Observer>,
    address: String,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        match transport.tag_queue(&address, &heartbeat_tags()).await {
            Ok(()) => observer.record_event(&ObserverEvent::HeartbeatTick {
                address: address.clone(),
            }),
            Err(e) => {
                tracing::warn!(queue = %address, error = %e, "Heartbeat failed");
                observer.record_event(&ObserverEvent::Error {
                    component: "heartbeat".into(),
                    message: e.to_string(),
                });
            }
        }
    }
    tracing::debug!(queue = %address, "Heartbeat loop stopped");
}
