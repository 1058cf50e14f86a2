pub mod memory;
#[cfg(feature = "sqs")]
pub mod sqs;
pub mod traits;

pub use memory::{InMemoryTransport, InMemoryTransportStats};
#[cfg(feature = "sqs")]
pub use sqs::SqsTransport;
pub use traits::{
    attribute, QueuePage, RawMessage, ReceiveRequest, SendRequest, Transport, MAX_BATCH_SIZE,
    MAX_WAIT_SECONDS,
};

use crate::config::{TransportBackend, TransportConfig};
use crate::error::Result;
use std::sync::Arc;

/// Build the transport selected by `[transport].backend`.
pub async fn create_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    match config.backend {
        TransportBackend::Memory => Ok(Arc::new(InMemoryTransport::new())),
        #[cfg(feature = "sqs")]
        TransportBackend::Sqs => Ok(Arc::new(SqsTransport::connect(config).await?)),
        #[cfg(not(feature = "sqs"))]
        TransportBackend::Sqs => Err(crate::error::Error::Config(
            "transport.backend = \"sqs\" requires building with --features sqs".into(),
        )),
    }
}
