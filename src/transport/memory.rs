//! In-process queue transport.
//!
//! Behaves like a managed at-least-once queue service closely enough to run
//! the whole request/reply protocol inside one process: visibility timeouts
//! with fresh receipt handles on every receive, delayed delivery, long
//! polling, FIFO queues with per-group in-flight locking and deduplication,
//! tags, approximate depth and paginated prefix listing.

use super::traits::{
    attribute, QueuePage, RawMessage, ReceiveRequest, SendRequest, Transport, MAX_BATCH_SIZE,
    MAX_WAIT_SECONDS,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

const URL_PREFIX: &str = "memory://queues/";
const DEDUP_WINDOW: Duration = Duration::from_secs(300);
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u32 = 30;
const DEFAULT_RETENTION_SECS: u64 = 345_600;
const MAX_QUEUE_NAME_LEN: usize = 80;
const MAX_LIST_RESULTS: usize = 1000;
/// Upper bound between re-checks while long polling, so delayed messages and
/// expired visibility timeouts are noticed without a send to wake us.
const POLL_SLICE: Duration = Duration::from_millis(25);

/// Runtime counters for tests and operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryTransportStats {
    pub queues_created: u64,
    pub queues_deleted: u64,
    pub messages_sent: u64,
    /// Sends collapsed by FIFO deduplication.
    pub messages_deduplicated: u64,
    pub messages_received: u64,
    pub messages_deleted: u64,
    pub delete_calls: u64,
    pub tag_calls: u64,
}

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
    group_id: Option<String>,
    sent_at: Instant,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

impl StoredMessage {
    fn in_flight(&self, now: Instant) -> bool {
        self.receipt_handle.is_some() && self.visible_at > now
    }
}

#[derive(Debug)]
struct MemoryQueue {
    url: String,
    fifo: bool,
    content_based_deduplication: bool,
    visibility_timeout_secs: u32,
    retention: Duration,
    tags: HashMap<String, String>,
    messages: VecDeque<StoredMessage>,
    dedup: HashMap<String, (String, Instant)>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn new(name: &str, attributes: &HashMap<String, String>) -> Result<Self> {
        let fifo = flag(attributes, attribute::FIFO_QUEUE);
        if fifo != name.ends_with(".fifo") {
            return Err(Error::InvalidRequest(format!(
                "queue name '{name}' must end with .fifo exactly when FifoQueue=true"
            )));
        }
        let visibility_timeout_secs = parse_attr(
            attributes,
            attribute::VISIBILITY_TIMEOUT,
            DEFAULT_VISIBILITY_TIMEOUT_SECS,
        )?;
        let retention_secs = parse_attr(
            attributes,
            attribute::MESSAGE_RETENTION_PERIOD,
            DEFAULT_RETENTION_SECS,
        )?;

        Ok(Self {
            url: format!("{URL_PREFIX}{name}"),
            fifo,
            content_based_deduplication: flag(attributes, attribute::CONTENT_BASED_DEDUPLICATION),
            visibility_timeout_secs,
            retention: Duration::from_secs(retention_secs),
            tags: HashMap::new(),
            messages: VecDeque::new(),
            dedup: HashMap::new(),
            notify: Arc::new(Notify::new()),
        })
    }

    fn expire(&mut self, now: Instant) {
        let retention = self.retention;
        self.messages
            .retain(|m| now.saturating_duration_since(m.sent_at) < retention);
        self.dedup
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < DEDUP_WINDOW);
    }

    /// Returns the message id and whether the send collapsed into an earlier one.
    fn enqueue(&mut self, request: SendRequest, now: Instant) -> Result<(String, bool)> {
        if request.body.is_empty() {
            return Err(Error::InvalidRequest("message body must not be empty".into()));
        }

        if self.fifo {
            if request.group_id.as_deref().is_none_or(str::is_empty) {
                return Err(Error::InvalidRequest(
                    "MessageGroupId is required for FIFO queues".into(),
                ));
            }
            let dedup_id = match (&request.deduplication_id, self.content_based_deduplication) {
                (Some(id), _) => id.clone(),
                (None, true) => hex::encode(Sha256::digest(request.body.as_bytes())),
                (None, false) => {
                    return Err(Error::InvalidRequest(
                        "FIFO queue without content-based deduplication needs a deduplication id"
                            .into(),
                    ))
                }
            };
            if let Some((message_id, _)) = self.dedup.get(&dedup_id) {
                return Ok((message_id.clone(), true));
            }
            let message_id = Uuid::new_v4().to_string();
            self.dedup.insert(dedup_id, (message_id.clone(), now));
            self.push(message_id.clone(), request, now);
            return Ok((message_id, false));
        }

        let message_id = Uuid::new_v4().to_string();
        self.push(message_id.clone(), request, now);
        Ok((message_id, false))
    }

    fn push(&mut self, message_id: String, request: SendRequest, now: Instant) {
        let delay = if self.fifo {
            Duration::ZERO
        } else {
            Duration::from_secs(u64::from(request.delay_seconds))
        };
        self.messages.push_back(StoredMessage {
            message_id,
            body: request.body,
            attributes: request.attributes,
            group_id: request.group_id,
            sent_at: now,
            visible_at: now + delay,
            receipt_handle: None,
        });
    }

    fn take_visible(&mut self, request: &ReceiveRequest, now: Instant) -> Vec<RawMessage> {
        let locked_groups: HashSet<String> = if self.fifo {
            self.messages
                .iter()
                .filter(|m| m.in_flight(now))
                .filter_map(|m| m.group_id.clone())
                .collect()
        } else {
            HashSet::new()
        };
        let visibility = Duration::from_secs(u64::from(
            request
                .visibility_timeout_secs
                .unwrap_or(self.visibility_timeout_secs),
        ));

        let mut batch = Vec::new();
        for message in &mut self.messages {
            if batch.len() >= request.max_messages {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            if let Some(group) = &message.group_id {
                if locked_groups.contains(group) {
                    continue;
                }
            }

            let handle = Uuid::new_v4().to_string();
            message.receipt_handle = Some(handle.clone());
            message.visible_at = now + visibility;
            batch.push(RawMessage {
                message_id: message.message_id.clone(),
                receipt_handle: handle,
                body: message.body.clone(),
                attributes: select_attributes(&message.attributes, &request.attribute_names),
            });
        }
        batch
    }

    fn delete(&mut self, receipt_handles: &[String]) -> u64 {
        let before = self.messages.len();
        self.messages.retain(|m| {
            m.receipt_handle
                .as_ref()
                .is_none_or(|handle| !receipt_handles.contains(handle))
        });
        (before - self.messages.len()) as u64
    }

    fn visible_count(&self, now: Instant) -> u64 {
        self.messages.iter().filter(|m| m.visible_at <= now).count() as u64
    }
}

#[derive(Debug)]
struct TransportState {
    queues: BTreeMap<String, MemoryQueue>,
    available: bool,
    stats: InMemoryTransportStats,
}

impl TransportState {
    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::TransportUnavailable(
                "in-memory transport switched off".into(),
            ))
        }
    }

    fn queue_mut(&mut self, queue_url: &str) -> Result<&mut MemoryQueue> {
        queue_name(queue_url)
            .and_then(|name| self.queues.get_mut(name))
            .ok_or_else(|| Error::queue_not_found(queue_url))
    }
}

/// Queue transport backed by process memory. Cloning shares the same queues.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    inner: Arc<Mutex<TransportState>>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransportState {
                queues: BTreeMap::new(),
                available: true,
                stats: InMemoryTransportStats::default(),
            })),
        }
    }

    /// Simulate an outage: while `false`, every call fails with
    /// [`Error::TransportUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.lock_state().available = available;
    }

    pub fn stats(&self) -> InMemoryTransportStats {
        self.lock_state().stats
    }

    pub fn queue_exists(&self, queue_url: &str) -> bool {
        let state = self.lock_state();
        queue_name(queue_url).is_some_and(|name| state.queues.contains_key(name))
    }

    /// Addresses of every queue, sorted by name.
    pub fn queue_urls(&self) -> Vec<String> {
        self.lock_state()
            .queues
            .values()
            .map(|q| q.url.clone())
            .collect()
    }

    /// Messages stored on a queue, visible or in flight.
    pub fn message_count(&self, queue_url: &str) -> usize {
        let state = self.lock_state();
        queue_name(queue_url)
            .and_then(|name| state.queues.get(name))
            .map_or(0, |q| q.messages.len())
    }

    fn lock_state(&self) -> MutexGuard<'_, TransportState> {
        self.inner.lock()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
        tags: &HashMap<String, String>,
    ) -> Result<String> {
        validate_queue_name(name)?;
        let mut state = self.lock_state();
        state.check_available()?;
        if state.queues.contains_key(name) {
            return Err(Error::QueueAlreadyExists {
                name: name.to_string(),
            });
        }

        let mut queue = MemoryQueue::new(name, attributes)?;
        queue.tags.extend(tags.clone());
        let url = queue.url.clone();
        state.queues.insert(name.to_string(), queue);
        state.stats.queues_created += 1;
        Ok(url)
    }

    async fn get_queue_url(&self, name: &str) -> Result<String> {
        let state = self.lock_state();
        state.check_available()?;
        state
            .queues
            .get(name)
            .map(|q| q.url.clone())
            .ok_or_else(|| Error::queue_not_found(name))
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        let mut state = self.lock_state();
        state.check_available()?;
        let removed = queue_name(queue_url).and_then(|name| state.queues.remove(name));
        match removed {
            Some(queue) => {
                state.stats.queues_deleted += 1;
                queue.notify.notify_waiters();
                Ok(())
            }
            None => Err(Error::queue_not_found(queue_url)),
        }
    }

    async fn tag_queue(&self, queue_url: &str, tags: &HashMap<String, String>) -> Result<()> {
        let mut state = self.lock_state();
        state.check_available()?;
        state.queue_mut(queue_url)?.tags.extend(tags.clone());
        state.stats.tag_calls += 1;
        Ok(())
    }

    async fn get_queue_tags(&self, queue_url: &str) -> Result<HashMap<String, String>> {
        let mut state = self.lock_state();
        state.check_available()?;
        Ok(state.queue_mut(queue_url)?.tags.clone())
    }

    async fn list_queues(
        &self,
        prefix: &str,
        max_results: usize,
        page_token: Option<String>,
    ) -> Result<QueuePage> {
        let offset = match page_token.as_deref() {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::InvalidRequest(format!("invalid page token '{token}'")))?,
        };
        let page_size = max_results.clamp(1, MAX_LIST_RESULTS);

        let state = self.lock_state();
        state.check_available()?;
        let matching: Vec<&MemoryQueue> = state
            .queues
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(_, queue)| queue)
            .collect();

        let queue_urls: Vec<String> = matching
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|q| q.url.clone())
            .collect();
        let consumed = offset + queue_urls.len();
        let next_token = (consumed < matching.len()).then(|| consumed.to_string());

        Ok(QueuePage {
            queue_urls,
            next_token,
        })
    }

    async fn get_queue_depth(&self, queue_url: &str) -> Result<u64> {
        let mut state = self.lock_state();
        state.check_available()?;
        let now = Instant::now();
        let queue = state.queue_mut(queue_url)?;
        queue.expire(now);
        Ok(queue.visible_count(now))
    }

    async fn send(&self, queue_url: &str, request: SendRequest) -> Result<String> {
        let mut state = self.lock_state();
        state.check_available()?;
        let now = Instant::now();
        let queue = state.queue_mut(queue_url)?;
        queue.expire(now);
        let (message_id, deduplicated) = queue.enqueue(request, now)?;
        queue.notify.notify_waiters();

        if deduplicated {
            state.stats.messages_deduplicated += 1;
        } else {
            state.stats.messages_sent += 1;
        }
        Ok(message_id)
    }

    async fn receive_batch(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<RawMessage>> {
        if !(1..=MAX_BATCH_SIZE).contains(&request.max_messages) {
            return Err(Error::InvalidRequest(format!(
                "max_messages must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }
        if request.wait_time_secs > MAX_WAIT_SECONDS {
            return Err(Error::InvalidRequest(format!(
                "wait_time_secs must be at most {MAX_WAIT_SECONDS}"
            )));
        }

        // Every receive is a suspension point, as it would be over a network.
        tokio::task::yield_now().await;

        let deadline = Instant::now() + Duration::from_secs(u64::from(request.wait_time_secs));
        loop {
            let notify = {
                let mut state = self.lock_state();
                state.check_available()?;
                let now = Instant::now();
                let queue = state.queue_mut(queue_url)?;
                queue.expire(now);
                let notify = Arc::clone(&queue.notify);
                let batch = queue.take_visible(request, now);
                if !batch.is_empty() || now >= deadline {
                    state.stats.messages_received += batch.len() as u64;
                    return Ok(batch);
                }
                notify
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let _ = tokio::time::timeout(remaining.min(POLL_SLICE), notify.notified()).await;
        }
    }

    async fn delete_batch(&self, queue_url: &str, receipt_handles: &[String]) -> Result<()> {
        if receipt_handles.len() > MAX_BATCH_SIZE {
            return Err(Error::InvalidRequest(format!(
                "at most {MAX_BATCH_SIZE} receipt handles per delete call, got {}",
                receipt_handles.len()
            )));
        }
        let mut state = self.lock_state();
        state.check_available()?;
        let deleted = state.queue_mut(queue_url)?.delete(receipt_handles);
        state.stats.messages_deleted += deleted;
        state.stats.delete_calls += 1;
        Ok(())
    }
}

fn queue_name(queue_url: &str) -> Option<&str> {
    queue_url.strip_prefix(URL_PREFIX)
}

fn validate_queue_name(name: &str) -> Result<()> {
    let stem = name.strip_suffix(".fifo").unwrap_or(name);
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
        return Err(Error::InvalidRequest(format!(
            "queue name must be 1-{MAX_QUEUE_NAME_LEN} characters: '{name}'"
        )));
    }
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidRequest(format!(
            "queue name may only contain alphanumerics, '-' and '_': '{name}'"
        )));
    }
    Ok(())
}

fn flag(attributes: &HashMap<String, String>, key: &str) -> bool {
    attributes
        .get(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn parse_attr<T: std::str::FromStr>(
    attributes: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T> {
    match attributes.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid {key}: '{raw}'"))),
    }
}

fn select_attributes(
    attributes: &HashMap<String, String>,
    names: &[String],
) -> HashMap<String, String> {
    if names.iter().any(|n| n == "All" || n == ".*") {
        return attributes.clone();
    }
    attributes
        .iter()
        .filter(|(key, _)| names.iter().any(|n| n == *key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
