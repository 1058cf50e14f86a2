use super::traits::{Observer, ObserverEvent, ObserverMetric};
use std::any::Any;
use tracing::{debug, error, info, warn};

/// Forwards events to `tracing` with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::QueueCreated { address } => {
                info!(queue = %address, "queue created");
            }
            ObserverEvent::QueueDeleted { address } => {
                info!(queue = %address, "queue deleted");
            }
            ObserverEvent::HeartbeatTick { address } => {
                debug!(queue = %address, "heartbeat");
            }
            ObserverEvent::MessagePublished {
                destination,
                message_id,
            } => {
                debug!(destination = %destination, message_id = %message_id, "message published");
            }
            ObserverEvent::RepliesStored { count } => {
                debug!(count, "replies stored");
            }
            ObserverEvent::RepliesEvicted { count } => {
                info!(count, "uncollected replies evicted");
            }
            ObserverEvent::ReplyTimeout { correlation_id } => {
                warn!(correlation_id = %correlation_id, "reply timed out");
            }
            ObserverEvent::HandlerFailed { message_id, reason } => {
                warn!(message_id = %message_id, reason = %reason, "handler failed; message left for redelivery");
            }
            ObserverEvent::OutboxFallback { message_id } => {
                warn!(message_id = %message_id, "publish retries exhausted; message written to outbox");
            }
            ObserverEvent::DeliveryFailed {
                message_id,
                destination,
            } => {
                error!(message_id = %message_id, destination = %destination, "message could not be delivered");
            }
            ObserverEvent::SweepTriggered { sweeper } => {
                debug!(sweeper = %sweeper, "sweep triggered");
            }
            ObserverEvent::QueueSwept { address, depth } => {
                info!(queue = %address, depth, "idle queue swept");
            }
            ObserverEvent::Error { component, message } => {
                error!(component = %component, "{message}");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::BatchSize(size) => debug!(size, "receive batch"),
            ObserverMetric::ReplyLatency(d) => {
                debug!(latency_ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX), "reply latency");
            }
            ObserverMetric::CorrelationTableSize(size) => debug!(size, "correlation table size"),
        }
    }

    fn name(&self) -> &str {
        "log"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
