use std::time::Duration;

/// Discrete lifecycle and failure events emitted by the components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    QueueCreated {
        address: String,
    },
    QueueDeleted {
        address: String,
    },
    HeartbeatTick {
        address: String,
    },
    MessagePublished {
        destination: String,
        message_id: String,
    },
    /// Replies upserted into the correlation table after one receive call.
    RepliesStored {
        count: usize,
    },
    /// Uncollected replies removed by an aging sweep.
    RepliesEvicted {
        count: usize,
    },
    ReplyTimeout {
        correlation_id: String,
    },
    HandlerFailed {
        message_id: String,
        reason: String,
    },
    OutboxFallback {
        message_id: String,
    },
    DeliveryFailed {
        message_id: String,
        destination: String,
    },
    SweepTriggered {
        sweeper: String,
    },
    /// An idle queue was deleted by the sweeper.
    QueueSwept {
        address: String,
        depth: u64,
    },
    Error {
        component: String,
        message: String,
    },
}

impl ObserverEvent {
    /// Stable snake_case label, used as a metric label value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueCreated { .. } => "queue_created",
            Self::QueueDeleted { .. } => "queue_deleted",
            Self::HeartbeatTick { .. } => "heartbeat_tick",
            Self::MessagePublished { .. } => "message_published",
            Self::RepliesStored { .. } => "replies_stored",
            Self::RepliesEvicted { .. } => "replies_evicted",
            Self::ReplyTimeout { .. } => "reply_timeout",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::OutboxFallback { .. } => "outbox_fallback",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::SweepTriggered { .. } => "sweep_triggered",
            Self::QueueSwept { .. } => "queue_swept",
            Self::Error { .. } => "error",
        }
    }
}

/// Numeric samples.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverMetric {
    /// Messages returned by one receive call.
    BatchSize(usize),
    /// How long a `get_response` caller waited for its reply.
    ReplyLatency(Duration),
    CorrelationTableSize(usize),
}

/// Sink for events and metrics, injected into every component.
pub trait Observer: Send + Sync + 'static {
    fn record_event(&self, event: &ObserverEvent);

    fn record_metric(&self, metric: &ObserverMetric);

    fn flush(&self) {}

    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn std::any::Any;
}
