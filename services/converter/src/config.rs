use reel_events::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the conversion worker
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration (consumer side, plus the dead letter producer)
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Message handling configuration
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// How long to wait for dead letters to flush on shutdown
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
}

/// What happens to a `VIDEO_CREATED` event whose conversion keeps failing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Park the event on the dead letter topic, then commit
    #[default]
    DeadLetter,
    /// Log and commit
    Drop,
}

/// Per-message handling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Delay before the first trigger retry
    #[serde(default = "default_trigger_initial_backoff_ms")]
    pub trigger_initial_backoff_ms: u64,
    /// Upper bound on a single retry delay
    #[serde(default = "default_trigger_max_backoff_ms")]
    pub trigger_max_backoff_ms: u64,
    /// Total time spent retrying one event; must stay well below
    /// `kafka.consumer.max_poll_interval_ms`
    #[serde(default = "default_trigger_max_elapsed_ms")]
    pub trigger_max_elapsed_ms: u64,
    /// Attempts per event, including the first
    #[serde(default = "default_trigger_max_attempts")]
    pub trigger_max_attempts: u32,
}

// Default value functions
fn default_service_name() -> String {
    "converter-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

fn default_flush_timeout_secs() -> u64 {
    5
}

fn default_trigger_initial_backoff_ms() -> u64 {
    200
}

fn default_trigger_max_backoff_ms() -> u64 {
    5_000
}

fn default_trigger_max_elapsed_ms() -> u64 {
    30_000
}

fn default_trigger_max_attempts() -> u32 {
    5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            flush_timeout_secs: default_flush_timeout_secs(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            trigger_initial_backoff_ms: default_trigger_initial_backoff_ms(),
            trigger_max_backoff_ms: default_trigger_max_backoff_ms(),
            trigger_max_elapsed_ms: default_trigger_max_elapsed_ms(),
            trigger_max_attempts: default_trigger_max_attempts(),
        }
    }
}

impl WorkerConfig {
    pub fn trigger_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.trigger_initial_backoff_ms)
    }

    pub fn trigger_max_backoff(&self) -> Duration {
        Duration::from_millis(self.trigger_max_backoff_ms)
    }

    pub fn trigger_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.trigger_max_elapsed_ms)
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/converter").required(false))
            .add_source(config::File::with_name("/etc/reel/converter").required(false))
            // CONVERTER__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("CONVERTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.kafka.validate()?;

        if self.worker.trigger_max_attempts == 0 {
            anyhow::bail!("worker.trigger_max_attempts must be at least 1");
        }
        if self.worker.trigger_max_elapsed_ms >= self.kafka.consumer.max_poll_interval_ms {
            anyhow::bail!(
                "worker.trigger_max_elapsed_ms ({}) must be below kafka.consumer.max_poll_interval_ms ({})",
                self.worker.trigger_max_elapsed_ms,
                self.kafka.consumer.max_poll_interval_ms
            );
        }
        Ok(())
    }

    /// Get dead letter flush timeout as Duration
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.service.flush_timeout_secs)
    }
}
