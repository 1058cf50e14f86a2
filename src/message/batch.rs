//! The unit of work handed out by a subscriber: one receive call's messages,
//! plus the bookkeeping needed to acknowledge exactly what was processed.

use super::Message;
use crate::error::Result;
use crate::transport::{RawMessage, Transport, MAX_BATCH_SIZE};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Messages from one (or, after [`merge`](Self::merge), several) receive
/// calls.
///
/// Iteration via [`next_message`](Self::next_message) moves messages from
/// pending to consumed. [`acknowledge`](Self::acknowledge) deletes every
/// consumed message; [`discard`](Self::discard) takes a message out of both
/// sets so it is never deleted and the transport redelivers it after its
/// visibility timeout.
pub struct MessageBatch {
    transport: Arc<dyn Transport>,
    queue_url: String,
    pending: VecDeque<Message>,
    consumed: Vec<Message>,
    seen: HashSet<String>,
}

impl MessageBatch {
    pub fn new(transport: Arc<dyn Transport>, queue_url: impl Into<String>, raw: Vec<RawMessage>) -> Self {
        Self {
            transport,
            queue_url: queue_url.into(),
            pending: raw.into_iter().map(Message::from).collect(),
            consumed: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Messages held, pending and consumed.
    pub fn len(&self) -> usize {
        self.pending.len() + self.consumed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn consumed_len(&self) -> usize {
        self.consumed.len()
    }

    /// Next unseen message, marked consumed.
    ///
    /// A redelivered duplicate (same message id) is marked consumed too, so
    /// its receipt handle gets acknowledged, but it is not yielded again.
    pub fn next_message(&mut self) -> Option<Message> {
        while let Some(message) = self.pending.pop_front() {
            let first_sighting = self.seen.insert(message.id.clone());
            self.consumed.push(message);
            if first_sighting {
                return self.consumed.last().cloned();
            }
        }
        None
    }

    /// Drain every pending message.
    pub fn consume(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.next_message()).collect()
    }

    /// Exclude every copy of `message_id` from acknowledgement. Returns
    /// whether anything was removed.
    pub fn discard(&mut self, message_id: &str) -> bool {
        let before = self.len();
        self.pending.retain(|m| m.id != message_id);
        self.consumed.retain(|m| m.id != message_id);
        before != self.len()
    }

    /// Delete all consumed messages from the queue, at most
    /// [`MAX_BATCH_SIZE`] per call. Returns how many receipt handles were
    /// deleted. On failure the handles not yet deleted stay consumed so a
    /// later call can retry them.
    pub async fn acknowledge(&mut self) -> Result<usize> {
        let mut deleted = 0;
        while !self.consumed.is_empty() {
            let take = self.consumed.len().min(MAX_BATCH_SIZE);
            let handles: Vec<String> = self.consumed[..take]
                .iter()
                .map(|m| m.receipt_handle.clone())
                .collect();
            self.transport.delete_batch(&self.queue_url, &handles).await?;
            self.consumed.drain(..take);
            deleted += take;
        }
        Ok(deleted)
    }

    /// Append another batch from the same queue.
    pub fn merge(&mut self, other: MessageBatch) {
        self.pending.extend(other.pending);
        self.consumed.extend(other.consumed);
        self.seen.extend(other.seen);
    }
}

impl fmt::Debug for MessageBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBatch")
            .field("queue_url", &self.queue_url)
            .field("pending", &self.pending.len())
            .field("consumed", &self.consumed.len())
            .finish()
    }
}
