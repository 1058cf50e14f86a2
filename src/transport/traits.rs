use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Per-call delete limit imposed by the transport.
pub const MAX_BATCH_SIZE: usize = 10;

/// Upper bound on a single long-poll receive.
pub const MAX_WAIT_SECONDS: u32 = 20;

/// Queue attribute names understood by every transport backend.
pub mod attribute {
    pub const FIFO_QUEUE: &str = "FifoQueue";
    pub const CONTENT_BASED_DEDUPLICATION: &str = "ContentBasedDeduplication";
    pub const MESSAGE_RETENTION_PERIOD: &str = "MessageRetentionPeriod";
    pub const VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";
}

/// Everything needed to put one message on a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub body: String,
    pub attributes: HashMap<String, String>,
    /// Ordering/partition key; required by FIFO queues.
    pub group_id: Option<String>,
    /// Explicit deduplication id; FIFO queues with content-based dedup fall
    /// back to a hash of the body.
    pub deduplication_id: Option<String>,
    pub delay_seconds: u32,
}

/// Parameters of one receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// 1..=10.
    pub max_messages: usize,
    pub attribute_names: Vec<String>,
    /// `None` uses the queue's own `VisibilityTimeout` attribute.
    pub visibility_timeout_secs: Option<u32>,
    /// Long-poll wait, 0..=20.
    pub wait_time_secs: u32,
}

impl Default for ReceiveRequest {
    fn default() -> Self {
        Self {
            max_messages: MAX_BATCH_SIZE,
            attribute_names: Vec::new(),
            visibility_timeout_secs: None,
            wait_time_secs: MAX_WAIT_SECONDS,
        }
    }
}

/// A message exactly as the transport handed it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueuePage {
    pub queue_urls: Vec<String>,
    pub next_token: Option<String>,
}

/// Queue transport gateway; the only component that talks to the wire.
///
/// Implementations own no business logic. They must map their native errors
/// onto [`crate::Error`]: `QueueAlreadyExists` on a create race,
/// `QueueNotFound` for a missing queue, `TransportUnavailable` otherwise.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Create a queue and return its address.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
        tags: &HashMap<String, String>,
    ) -> Result<String>;

    /// Resolve the address of an existing queue by name.
    async fn get_queue_url(&self, name: &str) -> Result<String>;

    async fn delete_queue(&self, queue_url: &str) -> Result<()>;

    /// Merge `tags` into the queue's tags.
    async fn tag_queue(&self, queue_url: &str, tags: &HashMap<String, String>) -> Result<()>;

    async fn get_queue_tags(&self, queue_url: &str) -> Result<HashMap<String, String>>;

    /// List queue addresses whose name starts with `prefix`.
    async fn list_queues(
        &self,
        prefix: &str,
        max_results: usize,
        page_token: Option<String>,
    ) -> Result<QueuePage>;

    /// Approximate number of visible messages.
    async fn get_queue_depth(&self, queue_url: &str) -> Result<u64>;

    /// Send one message; returns the transport-assigned message id.
    async fn send(&self, queue_url: &str, request: SendRequest) -> Result<String>;

    /// One long-poll receive. An empty vec means the wait elapsed with nothing visible.
    async fn receive_batch(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<RawMessage>>;

    /// Delete up to [`MAX_BATCH_SIZE`] messages by receipt handle.
    async fn delete_batch(&self, queue_url: &str, receipt_handles: &[String]) -> Result<()>;
}
