use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "REPLYQUEUE_CONFIG";

// ── Top-level config ─────────────────────────────────────────────

/// Root configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Where this config was loaded from. Computed, never serialized.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub subscriber: SubscriberConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub reply_queue: ReplyQueueConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Transport ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportBackend {
    /// In-process queues; state dies with the process.
    #[default]
    Memory,
    /// Amazon SQS (or an SQS-compatible endpoint). Needs the `sqs` feature.
    Sqs,
}

impl std::str::FromStr for TransportBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqs" => Ok(Self::Sqs),
            other => bail!("unknown transport backend '{other}' (expected memory or sqs)"),
        }
    }
}

/// Queue transport configuration (`[transport]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransportConfig {
    #[serde(default)]
    pub backend: TransportBackend,
    /// AWS region for the sqs backend.
    #[serde(default = "default_region")]
    pub region: String,
    /// Override endpoint, e.g. a local SQS emulator.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Static credentials. When unset the default AWS provider chain is used.
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

fn default_region() -> String {
    "us-east-1".into()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::default(),
            region: default_region(),
            endpoint_url: None,
            access_key: None,
            secret_key: None,
        }
    }
}

// ── Subscriber ───────────────────────────────────────────────────

/// Receive-loop tuning (`[subscriber]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubscriberConfig {
    /// Messages per receive call, 1..=10.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u32,
    /// Long-poll wait per receive call, 1..=20.
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u32,
    /// Pause after a failed receive before polling again.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

fn default_max_messages() -> usize {
    10
}

fn default_visibility_timeout_secs() -> u32 {
    30
}

fn default_wait_time_secs() -> u32 {
    20
}

fn default_error_backoff_ms() -> u64 {
    1000
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            wait_time_secs: default_wait_time_secs(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl SubscriberConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

// ── Reliability ──────────────────────────────────────────────────

/// Publish retry policy (`[reliability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityConfig {
    /// Send attempts before falling back to the outbox.
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
    /// Fixed pause between attempts.
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
}

fn default_publish_retries() -> u32 {
    3
}

fn default_publish_backoff_ms() -> u64 {
    250
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            publish_retries: default_publish_retries(),
            publish_backoff_ms: default_publish_backoff_ms(),
        }
    }
}

// ── Reply queue ──────────────────────────────────────────────────

/// Ephemeral reply inbox configuration (`[reply_queue]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReplyQueueConfig {
    /// Logical name; also the prefix of every physical reply queue and of the
    /// shared sweeper queue.
    #[serde(default = "default_reply_queue_name")]
    pub name: String,
    /// Transport-side retention of unread replies.
    #[serde(default = "default_queue_message_retention_secs")]
    pub queue_message_retention_secs: u64,
    /// How long an uncollected reply stays in the correlation table.
    #[serde(default = "default_reply_max_age_ms")]
    pub reply_max_age_ms: u64,
    /// Stored replies between forced aging sweeps.
    #[serde(default = "default_messages_before_cleaning")]
    pub messages_before_cleaning: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Granularity of `get_response` polling.
    #[serde(default = "default_response_poll_interval_ms")]
    pub response_poll_interval_ms: u64,
    #[serde(default = "default_response_timeout_secs")]
    pub default_response_timeout_secs: u64,
}

fn default_reply_queue_name() -> String {
    "reply_queue_".into()
}

fn default_queue_message_retention_secs() -> u64 {
    60
}

fn default_reply_max_age_ms() -> u64 {
    20_000
}

fn default_messages_before_cleaning() -> usize {
    200
}

fn default_heartbeat_interval_ms() -> u64 {
    60_000
}

fn default_response_poll_interval_ms() -> u64 {
    50
}

fn default_response_timeout_secs() -> u64 {
    10
}

impl Default for ReplyQueueConfig {
    fn default() -> Self {
        Self {
            name: default_reply_queue_name(),
            queue_message_retention_secs: default_queue_message_retention_secs(),
            reply_max_age_ms: default_reply_max_age_ms(),
            messages_before_cleaning: default_messages_before_cleaning(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            response_poll_interval_ms: default_response_poll_interval_ms(),
            default_response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

impl ReplyQueueConfig {
    pub fn reply_max_age(&self) -> Duration {
        Duration::from_millis(self.reply_max_age_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn response_poll_interval(&self) -> Duration {
        Duration::from_millis(self.response_poll_interval_ms)
    }

    pub fn default_response_timeout(&self) -> Duration {
        Duration::from_secs(self.default_response_timeout_secs)
    }
}

// ── Sweeper ──────────────────────────────────────────────────────

/// What to do with a prefix-matching queue that carries no readable
/// `heartbeat` tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MissingHeartbeatPolicy {
    /// Leave it alone and log a warning.
    #[default]
    Skip,
    /// Treat it as idle and delete it.
    Delete,
}

/// Idle queue garbage collection (`[sweeper]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Page size for prefix listing, 1..=1000.
    #[serde(default = "default_list_queues_max_results")]
    pub list_queues_max_results: usize,
    /// A queue whose heartbeat is older than this is deleted.
    #[serde(default = "default_idle_queue_retention_secs")]
    pub idle_queue_retention_secs: u64,
    /// Trigger cadence; triggers fire on multiples of this since the epoch.
    #[serde(default = "default_trigger_interval_secs")]
    pub trigger_interval_secs: u64,
    #[serde(default)]
    pub missing_heartbeat: MissingHeartbeatPolicy,
}

fn default_true() -> bool {
    true
}

fn default_list_queues_max_results() -> usize {
    1000
}

fn default_idle_queue_retention_secs() -> u64 {
    120
}

fn default_trigger_interval_secs() -> u64 {
    120
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            list_queues_max_results: default_list_queues_max_results(),
            idle_queue_retention_secs: default_idle_queue_retention_secs(),
            trigger_interval_secs: default_trigger_interval_secs(),
            missing_heartbeat: MissingHeartbeatPolicy::default(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────

/// Observer backend selection (`[observability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservabilityConfig {
    /// "log" | "none" | "prometheus"
    #[serde(default = "default_observability_backend")]
    pub backend: String,
}

fn default_observability_backend() -> String {
    "log".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_observability_backend(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// Default location: `<platform config dir>/replyqueue/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "replyqueue").map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    /// Resolve and load the effective configuration.
    ///
    /// Order: `explicit` path, then `REPLYQUEUE_CONFIG`, then the platform
    /// default path. An explicitly named file must exist; a missing default
    /// file yields built-in defaults. Environment overrides are applied and
    /// the result is validated.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load_from_path(&path).await?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load_from_path(&path).await?,
                _ => Self::default(),
            },
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `REPLYQUEUE_*` overrides from an arbitrary lookup. Empty values
    /// are ignored; an unparsable backend is logged and ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(region) = get("REPLYQUEUE_REGION") {
            self.transport.region = region;
        }
        if let Some(endpoint) = get("REPLYQUEUE_ENDPOINT_URL") {
            self.transport.endpoint_url = Some(endpoint);
        }
        if let Some(backend) = get("REPLYQUEUE_BACKEND") {
            match backend.parse() {
                Ok(parsed) => self.transport.backend = parsed,
                Err(e) => tracing::warn!("Ignoring REPLYQUEUE_BACKEND: {e}"),
            }
        }
        if let Some(name) = get("REPLYQUEUE_REPLY_QUEUE_NAME") {
            self.reply_queue.name = name;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sub = &self.subscriber;
        if !(1..=10).contains(&sub.max_messages) {
            bail!("subscriber.max_messages must be between 1 and 10");
        }
        if !(1..=20).contains(&sub.wait_time_secs) {
            bail!("subscriber.wait_time_secs must be between 1 and 20");
        }

        if self.reliability.publish_retries == 0 {
            bail!("reliability.publish_retries must be at least 1");
        }

        let rq = &self.reply_queue;
        if rq.name.trim().is_empty() {
            bail!("reply_queue.name must not be empty");
        }
        // Physical names append a 32-char uuid and the sweeper appends
        // "sweeper.fifo"; the transport caps names at 80 characters.
        if rq.name.len() > 80 - 32 {
            bail!("reply_queue.name must be at most 48 characters");
        }
        if !rq
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("reply_queue.name may only contain alphanumerics, '-' and '_'");
        }
        if rq.heartbeat_interval_ms == 0 {
            bail!("reply_queue.heartbeat_interval_ms must be greater than 0");
        }
        if rq.response_poll_interval_ms == 0 {
            bail!("reply_queue.response_poll_interval_ms must be greater than 0");
        }
        if rq.messages_before_cleaning == 0 {
            bail!("reply_queue.messages_before_cleaning must be greater than 0");
        }

        let sw = &self.sweeper;
        if !(1..=1000).contains(&sw.list_queues_max_results) {
            bail!("sweeper.list_queues_max_results must be between 1 and 1000");
        }
        if sw.trigger_interval_secs == 0 {
            bail!("sweeper.trigger_interval_secs must be greater than 0");
        }
        if sw.enabled && rq.heartbeat_interval_ms / 1000 >= sw.idle_queue_retention_secs {
            tracing::warn!(
                "reply_queue.heartbeat_interval_ms ({}) is not shorter than \
                 sweeper.idle_queue_retention_secs ({}s); live queues may be swept",
                rq.heartbeat_interval_ms,
                sw.idle_queue_retention_secs
            );
        }

        match self.observability.backend.as_str() {
            "log" | "none" | "noop" | "prometheus" => {}
            other => bail!("observability.backend '{other}' is not supported"),
        }

        if self.transport.access_key.is_some() != self.transport.secret_key.is_some() {
            bail!("transport.access_key and transport.secret_key must be set together");
        }
        Ok(())
    }

    /// JSON schema of the config file, pretty-printed.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).context("Failed to render config schema")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.transport.backend, TransportBackend::Memory);
        assert_eq!(config.subscriber.max_messages, 10);
        assert_eq!(config.subscriber.wait_time_secs, 20);
        assert_eq!(config.reliability.publish_retries, 3);
        assert_eq!(config.reliability.publish_backoff_ms, 250);
        assert_eq!(config.reply_queue.name, "reply_queue_");
        assert_eq!(config.reply_queue.reply_max_age(), Duration::from_secs(20));
        assert_eq!(config.sweeper.idle_queue_retention_secs, 120);
        assert_eq!(config.sweeper.missing_heartbeat, MissingHeartbeatPolicy::Skip);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [transport]
            backend = "sqs"
            region = "eu-west-1"

            [sweeper]
            missing_heartbeat = "delete"
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.backend, TransportBackend::Sqs);
        assert_eq!(config.transport.region, "eu-west-1");
        assert_eq!(config.sweeper.missing_heartbeat, MissingHeartbeatPolicy::Delete);
        assert_eq!(config.sweeper.list_queues_max_results, 1000);
        assert_eq!(config.reply_queue.heartbeat_interval_ms, 60_000);
    }

    #[test]
    fn toml_round_trip_preserves_values() {
        let mut config = Config::default();
        config.reply_queue.name = "orders_reply_".into();
        config.subscriber.error_backoff_ms = 5;
        let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed.reply_queue.name, "orders_reply_");
        assert_eq!(parsed.subscriber.error_backoff_ms, 5);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.subscriber.max_messages = 11;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.subscriber.wait_time_secs = 21;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.subscriber.wait_time_secs = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("wait_time_secs"));

        let mut config = Config::default();
        config.sweeper.list_queues_max_results = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reply_queue.name = "bad name".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.observability.backend = "otel".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.access_key = Some("AKIA".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_non_empty_values() {
        let vars = HashMap::from([
            ("REPLYQUEUE_REGION", "ap-south-1"),
            ("REPLYQUEUE_BACKEND", "SQS"),
            ("REPLYQUEUE_REPLY_QUEUE_NAME", "billing_"),
            ("REPLYQUEUE_ENDPOINT_URL", ""),
        ]);
        let mut config = Config::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.transport.region, "ap-south-1");
        assert_eq!(config.transport.backend, TransportBackend::Sqs);
        assert_eq!(config.reply_queue.name, "billing_");
        assert!(config.transport.endpoint_url.is_none());
    }

    #[test]
    fn unknown_backend_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides_from(|key| {
            (key == "REPLYQUEUE_BACKEND").then(|| "kafka".to_string())
        });
        assert_eq!(config.transport.backend, TransportBackend::Memory);
    }

    #[tokio::test]
    async fn load_from_path_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[reliability]\npublish_retries = 5\n")
            .await
            .unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.reliability.publish_retries, 5);
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn load_from_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load_from_path(&missing).await.is_err());
    }

    #[test]
    fn json_schema_names_every_section() {
        let schema = Config::json_schema().unwrap();
        for section in ["transport", "subscriber", "reliability", "reply_queue", "sweeper"] {
            assert!(schema.contains(section), "schema missing {section}");
        }
    }
}
