//! Kafka configuration for the Pixtally event pipeline.
//!
//! Connection, security, producer and consumer settings for the image-uploaded
//! topic and its dead-letter companion. Also carries the retry policy the
//! aggregation consumer applies to transient failures.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Producer-side delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Broker-level retries for a single send
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Linger time in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
    /// Upper bound on how long a publish may wait for delivery
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

fn default_retries() -> u32 {
    3
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            acks: default_acks(),
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

/// Consumer-side settings, including the handler retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group ID shared by all aggregation workers
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
    /// Attempts per message (and per counter write) before giving up
    #[serde(default = "default_max_handle_attempts")]
    pub max_handle_attempts: u32,
    /// First retry delay in milliseconds
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    /// Ceiling for the retry delay in milliseconds
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Timeout applied to each store call made while handling a message
    #[serde(default = "default_handle_timeout_ms")]
    pub handle_timeout_ms: u64,
}

fn default_group_id() -> String {
    "pixtally-aggregation".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

fn default_max_handle_attempts() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    200
}

fn default_retry_max_ms() -> u64 {
    10000
}

fn default_handle_timeout_ms() -> u64 {
    10000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
            max_handle_attempts: default_max_handle_attempts(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            handle_timeout_ms: default_handle_timeout_ms(),
        }
    }
}

/// Topic names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic carrying aggregation events (JSON arrays of image IDs)
    #[serde(default = "default_image_uploaded_topic")]
    pub image_uploaded: String,
    /// Dead letter topic for messages the consumer gave up on
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
}

fn default_image_uploaded_topic() -> String {
    "pixtally.images.uploaded".to_string()
}

fn default_dlq_topic() -> String {
    "pixtally.images.uploaded.dlq".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            image_uploaded: default_image_uploaded_topic(),
            dead_letter_queue: default_dlq_topic(),
        }
    }
}

/// Main Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional librdkafka properties passed through verbatim
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "pixtally".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
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

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("retries", self.producer.retries.to_string());
        config.set("acks", &self.producer.acks);
        config.set("linger.ms", self.producer.linger_ms.to_string());
        config.set("compression.type", &self.producer.compression_type);
        config.set(
            "message.timeout.ms",
            self.producer.publish_timeout_ms.to_string(),
        );

        config
    }

    /// Build a consumer ClientConfig. Offsets are always committed manually.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.publish_timeout_ms)
    }

    pub fn handle_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer.handle_timeout_ms)
    }

    /// Retry policy derived from the consumer settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.consumer.max_handle_attempts,
            initial_interval: Duration::from_millis(self.consumer.retry_initial_ms),
            max_interval: Duration::from_millis(self.consumer.retry_max_ms),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "bootstrap_servers".to_string(),
            ));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired(
                "consumer.group_id".to_string(),
            ));
        }

        if self.topics.image_uploaded == self.topics.dead_letter_queue {
            return Err(ConfigError::InvalidValue {
                key: "topics.dead_letter_queue".to_string(),
                message: "must differ from topics.image_uploaded".to_string(),
            });
        }

        if self.consumer.max_handle_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "consumer.max_handle_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "sasl.username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Bounded exponential-backoff retry settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Fresh backoff schedule for one retried operation
    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            // Attempts are bounded by max_attempts, not elapsed time
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        KafkaConfig::default().retry_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap_servers, "localhost:9092");
        assert_eq!(config.topics.image_uploaded, "pixtally.images.uploaded");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let config = KafkaConfig::new("broker:9092");
        let consumer_config = config.build_consumer_config();

        assert_eq!(consumer_config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(consumer_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(
            consumer_config.get("group.id"),
            Some("pixtally-aggregation")
        );
    }

    #[test]
    fn test_producer_config_bounds_delivery() {
        let mut config = KafkaConfig::default();
        config.producer.publish_timeout_ms = 1500;
        let producer_config = config.build_producer_config();

        assert_eq!(producer_config.get("message.timeout.ms"), Some("1500"));
        assert_eq!(producer_config.get("acks"), Some("all"));
        assert!(producer_config.get("sasl.mechanism").is_none());
    }

    #[test]
    fn test_sasl_requires_username() {
        let mut config = KafkaConfig::default();
        config.security_protocol = SecurityProtocol::SaslSsl;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        config.sasl.username = Some("svc".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dead_letter_topic_must_differ() {
        let mut config = KafkaConfig::default();
        config.topics.dead_letter_queue = config.topics.image_uploaded.clone();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_retry_policy_from_consumer_settings() {
        let mut config = KafkaConfig::default();
        config.consumer.max_handle_attempts = 2;
        config.consumer.retry_initial_ms = 10;

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_interval, Duration::from_millis(10));
        assert!(policy.backoff().max_elapsed_time.is_none());
    }
}
