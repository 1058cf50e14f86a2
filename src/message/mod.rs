pub mod batch;

pub use batch::MessageBatch;

use crate::error::{Error, Result};
use crate::reply_queue::ReplyQueue;
use crate::transport::{RawMessage, SendRequest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Attribute carrying the address replies should be sent to.
pub const REPLY_TO: &str = "ReplyTo";
/// Attribute carrying the correlation id, echoed back by responders.
pub const REQUEST_MESSAGE_ID: &str = "RequestMessageId";

/// An outbound message. Owns its destination so one publisher can serve any
/// number of queues; optionally bound to a [`ReplyQueue`] for request/reply.
#[derive(Clone)]
pub struct RequestMessage {
    id: String,
    body: String,
    destination: String,
    attributes: HashMap<String, String>,
    group_id: Option<String>,
    deduplication_id: Option<String>,
    delay_seconds: u32,
    reply_to: Option<Arc<ReplyQueue>>,
    created_at: DateTime<Utc>,
}

impl RequestMessage {
    pub fn new(body: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            body: body.into(),
            destination: destination.into(),
            attributes: HashMap::new(),
            group_id: None,
            deduplication_id: None,
            delay_seconds: 0,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    /// Ask the receiver to answer on `reply_queue`. The request id becomes the
    /// correlation id.
    #[must_use]
    pub fn with_reply_to(mut self, reply_queue: Arc<ReplyQueue>) -> Self {
        self.reply_to = Some(reply_queue);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    #[must_use]
    pub fn with_deduplication_id(mut self, deduplication_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(deduplication_id.into());
        self
    }

    #[must_use]
    pub fn with_delay_seconds(mut self, delay_seconds: u32) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn reply_to(&self) -> Option<&Arc<ReplyQueue>> {
        self.reply_to.as_ref()
    }

    /// Wire form of this message. Resolving the reply address creates the
    /// reply queue on first use.
    pub async fn to_send_request(&self) -> Result<SendRequest> {
        let mut attributes = self.attributes.clone();
        if let Some(reply_queue) = &self.reply_to {
            attributes.insert(REPLY_TO.to_string(), reply_queue.address().await?);
            attributes.insert(REQUEST_MESSAGE_ID.to_string(), self.id.clone());
        }

        Ok(SendRequest {
            body: self.body.clone(),
            attributes,
            group_id: self.group_id.clone(),
            deduplication_id: self.deduplication_id.clone(),
            delay_seconds: self.delay_seconds,
        })
    }

    /// Wait for the reply correlated with this request.
    pub async fn get_response(&self, timeout: Duration) -> Result<Message> {
        let reply_queue = self.reply_to.as_ref().ok_or_else(|| {
            Error::InvalidRequest(format!("message {} has no reply queue attached", self.id))
        })?;
        reply_queue.get_response(&self.id, timeout).await
    }
}

impl fmt::Debug for RequestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMessage")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("body_len", &self.body.len())
            .field("group_id", &self.group_id)
            .field("reply_to", &self.reply_to.as_ref().map(|q| q.name().to_string()))
            .finish_non_exhaustive()
    }
}

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    #[serde(skip)]
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn correlation_id(&self) -> Option<&str> {
        self.attributes.get(REQUEST_MESSAGE_ID).map(String::as_str)
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.attributes
            .get(REPLY_TO)
            .map(String::as_str)
            .filter(|addr| !addr.is_empty())
    }
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        Self {
            id: raw.message_id,
            receipt_handle: raw.receipt_handle,
            body: raw.body,
            attributes: raw.attributes,
            received_at: Utc::now(),
        }
    }
}
