use reel_events::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the catalog service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration (producer side)
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Object store configuration
    pub s3: S3Config,
    /// Catalog store configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
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
    /// How long to wait for the producer to flush on shutdown
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
}

/// S3-compatible object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploaded videos
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL clients use to fetch objects; defaults to the endpoint
    pub public_base_url: Option<String>,
    /// Uploads above this size use multipart upload
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Catalog store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Keep records in process memory instead of PostgreSQL
    #[serde(default)]
    pub in_memory: bool,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Upper bound on a multipart request body, in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "catalog-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_flush_timeout_secs() -> u64 {
    5
}

fn default_bucket() -> String {
    "videos".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    16 * 1024 * 1024 // 16MB
}

fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB, S3 minimum is 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024 // 512MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("s3.bucket", default_bucket())?
            .set_default("database.url", "")?
            // Add config file if present
            .add_source(config::File::with_name("config/catalog").required(false))
            .add_source(config::File::with_name("/etc/reel/catalog").required(false))
            // CATALOG__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("CATALOG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.database.in_memory && self.database.url.is_empty() {
            anyhow::bail!("database.url is required unless database.in_memory is set");
        }
        if self.s3.part_size_bytes < 5 * 1024 * 1024 {
            anyhow::bail!("s3.part_size_bytes must be at least 5MB");
        }
        self.kafka.validate()?;
        Ok(())
    }

    /// Get producer flush timeout as Duration
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.service.flush_timeout_secs)
    }
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

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl S3Config {
    /// Base URL of objects as seen by clients, without trailing slash
    pub fn public_base_url(&self) -> String {
        self.public_base_url
            .as_deref()
            .or(self.endpoint_url.as_deref())
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.region))
    }
}
