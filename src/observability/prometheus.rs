use super::traits::{Observer, ObserverEvent, ObserverMetric};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::any::Any;

/// Keeps counters in a private registry; `encode()` renders the text
/// exposition format for whatever endpoint the embedder exposes.
pub struct PrometheusObserver {
    registry: Registry,
    events: IntCounterVec,
    batch_size: Histogram,
    reply_latency: Histogram,
    correlation_table_size: IntGauge,
    queues_swept_depth: IntCounterVec,
}

impl PrometheusObserver {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new("replyqueue_events_total", "Lifecycle and failure events"),
            &["event"],
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("replyqueue_receive_batch_size", "Messages per receive call")
                .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 50.0, 200.0, 500.0]),
        )?;
        let reply_latency = Histogram::with_opts(
            HistogramOpts::new(
                "replyqueue_reply_latency_seconds",
                "Time callers waited for a correlated reply",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let correlation_table_size = IntGauge::new(
            "replyqueue_correlation_table_size",
            "Replies waiting to be collected",
        )?;
        let queues_swept_depth = IntCounterVec::new(
            Opts::new(
                "replyqueue_swept_messages_total",
                "Approximate messages discarded with swept queues",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(reply_latency.clone()))?;
        registry.register(Box::new(correlation_table_size.clone()))?;
        registry.register(Box::new(queues_swept_depth.clone()))?;

        Ok(Self {
            registry,
            events,
            batch_size,
            reply_latency,
            correlation_table_size,
            queues_swept_depth,
        })
    }

    /// Current metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode prometheus metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Observer for PrometheusObserver {
    fn record_event(&self, event: &ObserverEvent) {
        self.events.with_label_values(&[event.kind()]).inc();
        if let ObserverEvent::QueueSwept { depth, .. } = event {
            self.queues_swept_depth
                .with_label_values(&["discarded"])
                .inc_by(*depth);
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            #[allow(clippy::cast_precision_loss)]
            ObserverMetric::BatchSize(size) => self.batch_size.observe(*size as f64),
            ObserverMetric::ReplyLatency(d) => self.reply_latency.observe(d.as_secs_f64()),
            ObserverMetric::CorrelationTableSize(size) => self
                .correlation_table_size
                .set(i64::try_from(*size).unwrap_or(i64::MAX)),
        }
    }

    fn name(&self) -> &str {
        "prometheus"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counts_events_by_kind() {
        let obs = PrometheusObserver::new().unwrap();
        obs.record_event(&ObserverEvent::HeartbeatTick {
            address: "memory://queues/r".into(),
        });
        obs.record_event(&ObserverEvent::HeartbeatTick {
            address: "memory://queues/r".into(),
        });
        obs.record_event(&ObserverEvent::QueueSwept {
            address: "memory://queues/old".into(),
            depth: 4,
        });

        let text = obs.encode();
        assert!(text.contains("replyqueue_events_total{event=\"heartbeat_tick\"} 2"));
        assert!(text.contains("replyqueue_swept_messages_total{outcome=\"discarded\"} 4"));
    }

    #[test]
    fn records_metrics() {
        let obs = PrometheusObserver::new().unwrap();
        obs.record_metric(&ObserverMetric::CorrelationTableSize(3));
        obs.record_metric(&ObserverMetric::ReplyLatency(Duration::from_millis(120)));
        obs.record_metric(&ObserverMetric::BatchSize(10));

        let text = obs.encode();
        assert!(text.contains("replyqueue_correlation_table_size 3"));
        assert!(text.contains("replyqueue_reply_latency_seconds_count 1"));
        assert!(text.contains("replyqueue_receive_batch_size_count 1"));
    }
}
