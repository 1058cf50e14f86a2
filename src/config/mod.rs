pub mod schema;

pub use schema::{
    default_config_path, Config, MissingHeartbeatPolicy, ObservabilityConfig, ReliabilityConfig,
    ReplyQueueConfig, SubscriberConfig, SweeperConfig, TransportBackend, TransportConfig,
    CONFIG_PATH_ENV,
};
