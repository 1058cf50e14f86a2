pub mod outbox;
pub mod queue;
pub mod reliable;
pub mod traits;

pub use outbox::{JsonlOutbox, MemoryOutbox, Outbox, OutboxRecord};
pub use queue::QueuePublisher;
pub use reliable::RetryingPublisher;
pub use traits::{Delivery, Publisher};

use crate::config::ReliabilityConfig;
use crate::observability::Observer;
use crate::transport::Transport;
use std::sync::Arc;

/// Retrying publisher over `transport`, configured from `[reliability]`.
pub fn create_publisher(
    transport: Arc<dyn Transport>,
    config: &ReliabilityConfig,
    outbox: Option<Arc<dyn Outbox>>,
    observer: Arc<dyn Observer>,
) -> Arc<dyn Publisher> {
    let base: Arc<dyn Publisher> = Arc::new(QueuePublisher::new(transport, observer.clone()));
    let retrying = RetryingPublisher::from_config(base, config, observer);
    match outbox {
        Some(outbox) => Arc::new(retrying.with_outbox(outbox)),
        None => Arc::new(retrying),
    }
}
