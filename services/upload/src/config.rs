use pixtally_pipeline::KafkaConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the upload service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration shared by the publisher and the aggregation consumer
    pub kafka: KafkaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Where uploaded image bytes are written
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Shared-secret tokens for the admin endpoints
    #[serde(default)]
    pub auth: AuthConfig,
    /// Result sizes of the statistics endpoint
    #[serde(default)]
    pub statistics: StatisticsConfig,
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
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    #[default]
    Local,
    S3,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
    #[serde(default)]
    pub backend: BlobBackend,
    /// Root directory for the local backend
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// Required when `backend = "s3"`
    pub s3: Option<S3Config>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for uploaded images
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix; objects land at `{prefix}/{upload_link_id}/{file_name}`
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Maximum request body size, covering every file of one upload
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Base URL used in upload-link responses, e.g. `https://img.example.com`.
    /// Falls back to the request's Host header.
    pub public_base_url: Option<String>,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Shared-secret tokens, token -> principal name
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StatisticsConfig {
    #[serde(default = "default_format_limit")]
    pub format_limit: i64,
    #[serde(default = "default_camera_model_limit")]
    pub camera_model_limit: i64,
    #[serde(default = "default_day_limit")]
    pub day_limit: i64,
}

// Default value functions
fn default_service_name() -> String {
    "upload-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./upload")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_s3_prefix() -> String {
    "images".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_request_bytes() -> usize {
    100 * 1024 * 1024 // 100MB
}

fn default_format_limit() -> i64 {
    1
}

fn default_camera_model_limit() -> i64 {
    10
}

fn default_day_limit() -> i64 {
    30
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "upload-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("kafka.bootstrap_servers", "localhost:9092")?
            // Add config file if present
            .add_source(config::File::with_name("config/upload").required(false))
            .add_source(config::File::with_name("/etc/pixtally/upload").required(false))
            // Override with environment variables
            // UPLOAD__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("UPLOAD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks serde cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        self.kafka.validate()?;

        if self.blob_store.backend == BlobBackend::S3 && self.blob_store.s3.is_none() {
            anyhow::bail!("blob_store.s3 is required when blob_store.backend = \"s3\"");
        }

        if self.statistics.format_limit < 1
            || self.statistics.camera_model_limit < 1
            || self.statistics.day_limit < 1
        {
            anyhow::bail!("statistics limits must be at least 1");
        }

        Ok(())
    }

}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackend::default(),
            local_root: default_local_root(),
            s3: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            max_request_bytes: default_max_request_bytes(),
            public_base_url: None,
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            format_limit: default_format_limit(),
            camera_model_limit: default_camera_model_limit(),
            day_limit: default_day_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> anyhow::Result<Config> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_request_bytes(), 100 * 1024 * 1024);
        assert_eq!(default_local_root(), PathBuf::from("./upload"));

        let limits = StatisticsConfig::default();
        assert_eq!(
            (limits.format_limit, limits.camera_model_limit, limits.day_limit),
            (1, 10, 30)
        );
    }

    #[test]
    fn test_minimal_config_fills_sections() {
        let config = tokio_test::assert_ok!(parse(
            r#"
            [kafka]
            bootstrap_servers = "broker:9092"

            [database]
            url = "postgres://localhost/pixtally"

            [auth.tokens]
            s3cr3t = "admin"
            "#,
        ));

        assert_eq!(config.service.name, "upload-service");
        assert_eq!(config.blob_store.backend, BlobBackend::Local);
        assert_eq!(config.kafka.topics.image_uploaded, "pixtally.images.uploaded");
        assert_eq!(config.auth.tokens.get("s3cr3t").map(String::as_str), Some("admin"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_s3_backend_requires_section() {
        let mut config = parse(
            r#"
            [kafka]
            bootstrap_servers = "broker:9092"

            [database]
            url = "postgres://localhost/pixtally"

            [blob_store]
            backend = "s3"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        config.blob_store.s3 = Some(S3Config {
            bucket: "images".to_string(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: true,
            prefix: default_s3_prefix(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_statistics_limit_rejected() {
        let mut config = parse(
            r#"
            [kafka]
            bootstrap_servers = "broker:9092"

            [database]
            url = "postgres://localhost/pixtally"
            "#,
        )
        .unwrap();
        config.statistics.day_limit = 0;
        assert!(config.validate().is_err());
    }
}
