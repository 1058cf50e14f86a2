//! Error taxonomy shared by every component.
//!
//! Caller-facing operations (`send`, `get_response`, queue lifecycle) surface
//! these as typed failures so callers can branch on the kind: retry on
//! [`Error::TransportUnavailable`], degrade on [`Error::ReplyTimeout`], alert on
//! [`Error::DeliveryFailed`]. Background loops log them and keep going.

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network, auth or service failure talking to the queue transport.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// `create_queue` raced another creator; resolve the existing address instead.
    #[error("queue already exists: {name}")]
    QueueAlreadyExists { name: String },

    #[error("queue not found: {queue}")]
    QueueNotFound { queue: String },

    /// No reply with this correlation id arrived within the caller's timeout.
    #[error("no reply for correlation id {correlation_id} within {timeout_ms}ms")]
    ReplyTimeout {
        correlation_id: String,
        timeout_ms: u128,
    },

    /// Retries were exhausted and the outbox fallback was absent or failed.
    #[error("message {message_id} could not be delivered to {destination}: {reason}")]
    DeliveryFailed {
        message_id: String,
        destination: String,
        reason: String,
    },

    /// A message handler raised while processing one message.
    #[error("handler failed on message {message_id}: {reason}")]
    HandlerFailure { message_id: String, reason: String },

    #[error("outbox write failed for message {message_id}: {reason}")]
    OutboxWriteFailed { message_id: String, reason: String },

    /// The reply queue was torn down and cannot be used again.
    #[error("reply queue {name} is torn down")]
    ReplyQueueClosed { name: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Only transport outages are worth another attempt; everything else is
    /// deterministic and would fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_))
    }

    pub fn is_queue_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound { .. })
    }

    pub fn is_queue_already_exists(&self) -> bool {
        matches!(self, Self::QueueAlreadyExists { .. })
    }

    pub fn is_reply_timeout(&self) -> bool {
        matches!(self, Self::ReplyTimeout { .. })
    }

    pub(crate) fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_outages_are_retryable() {
        assert!(Error::TransportUnavailable("connection reset".into()).is_retryable());
        assert!(!Error::queue_not_found("q").is_retryable());
        assert!(!Error::InvalidRequest("bad".into()).is_retryable());
        assert!(!Error::ReplyTimeout {
            correlation_id: "1".into(),
            timeout_ms: 10,
        }
        .is_retryable());
    }

    #[test]
    fn kind_predicates_match_variants() {
        assert!(Error::queue_not_found("q").is_queue_not_found());
        assert!(Error::QueueAlreadyExists { name: "q".into() }.is_queue_already_exists());
        assert!(Error::ReplyTimeout {
            correlation_id: "abc".into(),
            timeout_ms: 5,
        }
        .is_reply_timeout());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::DeliveryFailed {
            message_id: "m-1".into(),
            destination: "memory://queues/orders".into(),
            reason: "transport unavailable: down".into(),
        };
        let text = err.to_string();
        assert!(text.contains("m-1"));
        assert!(text.contains("memory://queues/orders"));
    }
}
