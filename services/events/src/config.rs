//! Kafka configuration for the Reel event channel.
//!
//! Both services share this struct: the catalog service uses the producer
//! half, the conversion worker the consumer half.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Topic carrying every video lifecycle event.
pub const VIDEO_EVENTS_TOPIC: &str = "video-events";

/// Consumer group shared by all conversion worker replicas.
pub const CONVERTER_GROUP: &str = "video-converter";

/// Minimum broker protocol level the clients are pinned to.
pub const BROKER_VERSION_FALLBACK: &str = "2.6.0";

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Producer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Required acknowledgments. "1" waits for the partition leader only.
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Flush interval in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
    /// Delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

fn default_acks() -> String {
    "1".to_string()
}

fn default_linger_ms() -> u64 {
    500
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_message_timeout_ms() -> u64 {
    30000
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: default_acks(),
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
    /// How long an in-flight handler may keep running after shutdown is requested
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
    /// Consecutive non-fatal broker errors tolerated before giving up
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_group_id() -> String {
    CONVERTER_GROUP.to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_heartbeat_interval() -> u64 {
    3000
}

fn default_max_poll_interval() -> u64 {
    300000
}

fn default_drain_timeout() -> u64 {
    10000
}

fn default_max_consecutive_errors() -> u32 {
    50
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
            drain_timeout_ms: default_drain_timeout(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

/// Topic names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Video lifecycle events
    #[serde(default = "default_video_events_topic")]
    pub video_events: String,
    /// Dead letter topic for events the worker gave up on
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
}

fn default_video_events_topic() -> String {
    VIDEO_EVENTS_TOPIC.to_string()
}

fn default_dlq_topic() -> String {
    format!("{}.dlq", VIDEO_EVENTS_TOPIC)
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            video_events: default_video_events_topic(),
            dead_letter_queue: default_dlq_topic(),
        }
    }
}

/// Main Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Producer settings
    #[serde(default)]
    pub producer: ProducerConfig,
    /// Consumer settings
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Topic configuration
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "reel".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `KAFKA_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| default_bootstrap_servers());

        let mut config = Self::new(bootstrap_servers);

        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(group_id) = std::env::var("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Ok(topic) = std::env::var("KAFKA_VIDEO_EVENTS_TOPIC") {
            config.topics.video_events = topic;
        }
        if let Ok(topic) = std::env::var("KAFKA_DLQ_TOPIC") {
            config.topics.dead_letter_queue = topic;
        }
        if let Ok(linger) = std::env::var("KAFKA_LINGER_MS") {
            config.producer.linger_ms =
                linger.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "KAFKA_LINGER_MS".to_string(),
                    message: format!("not a number: {}", linger),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Broker addresses as a list
    pub fn broker_list(&self) -> Vec<&str> {
        self.bootstrap_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", self.broker_list().join(","));
        config.set("client.id", &self.client_id);
        config.set("api.version.request", "true");
        config.set("broker.version.fallback", BROKER_VERSION_FALLBACK);

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        // acks=1 is incompatible with the idempotent producer
        config.set("enable.idempotence", "false");
        config.set("acks", &self.producer.acks);
        config.set("linger.ms", self.producer.linger_ms.to_string());
        config.set("compression.type", &self.producer.compression_type);
        config.set(
            "message.timeout.ms",
            self.producer.message_timeout_ms.to_string(),
        );

        config
    }

    /// Build a consumer ClientConfig
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        // Offsets are committed explicitly after each handler returns.
        config.set("enable.auto.commit", "false");
        config.set("enable.auto.offset.store", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "heartbeat.interval.ms",
            self.consumer.heartbeat_interval_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    /// Delivery timeout as Duration
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.message_timeout_ms)
    }

    /// Drain timeout as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer.drain_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_list().is_empty() {
            return Err(ConfigError::MissingRequired(
                "bootstrap_servers".to_string(),
            ));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired(
                "consumer.group_id".to_string(),
            ));
        }

        if self.consumer.max_consecutive_errors == 0 {
            return Err(ConfigError::InvalidValue {
                key: "consumer.max_consecutive_errors".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.topics.video_events.is_empty() {
            return Err(ConfigError::MissingRequired(
                "topics.video_events".to_string(),
            ));
        }

        if self.topics.video_events == self.topics.dead_letter_queue {
            return Err(ConfigError::InvalidValue {
                key: "topics.dead_letter_queue".to_string(),
                message: "must differ from topics.video_events".to_string(),
            });
        }

        Ok(())
    }
}
