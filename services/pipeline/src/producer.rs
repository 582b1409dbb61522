//! Kafka producer for the Pixtally pipeline.
//!
//! Publishes aggregation events (the IDs of newly stored images) and
//! dead-letter records for messages the aggregation consumer gave up on.

use crate::config::KafkaConfig;
use crate::events::ImageUploadedEvent;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: Serialize>(topic: impl Into<String>, message: &T) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

/// Why a message ended up in the dead letter topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// The message can never be handled; it was committed
    Poison,
    /// Handling failed permanently; the message was left uncommitted
    Fatal,
}

/// Record written to the dead letter topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub kind: DeadLetterKind,
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Original payload, base64 encoded
    pub payload_base64: String,
    pub error: String,
    /// Handler-specific context, e.g. the work that was not applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        kind: DeadLetterKind,
        original_topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: &[u8],
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            original_topic: original_topic.into(),
            partition,
            offset,
            payload_base64: STANDARD.encode(payload),
            error: error.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Option<serde_json::Value>) -> Self {
        self.details = details;
        self
    }
}

/// Outbound side of the message channel for aggregation events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one aggregation event carrying the given image IDs
    async fn publish(&self, image_ids: &[Uuid]) -> Result<(), ProducerError>;
}

/// Destination for messages the consumer could not handle
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<(), ProducerError>;
}

/// Kafka producer shared by the HTTP path and the consumer's dead-letter path
pub struct KafkaProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl KafkaProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.topics.image_uploaded,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.publish_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();

        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(headers);

        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        debug!(size_bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn publish(&self, image_ids: &[Uuid]) -> Result<(), ProducerError> {
        let event = ImageUploadedEvent::new(image_ids.to_vec());
        let correlation_id = Uuid::new_v4().to_string();

        let mut message = OutgoingMessage::new_json(&self.config.topics.image_uploaded, &event)?
            .with_message_type("image_uploaded")
            .with_correlation_id(&correlation_id);
        if let Some(first) = image_ids.first() {
            message = message.with_key(first.to_string());
        }

        let delivery = self.send(message).await?;

        metrics::counter!("uploads.events.published").increment(1);
        debug!(
            image_count = image_ids.len(),
            partition = delivery.partition,
            offset = delivery.offset,
            correlation_id = %correlation_id,
            "Published image uploaded event"
        );

        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for KafkaProducer {
    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<(), ProducerError> {
        let kind = match record.kind {
            DeadLetterKind::Poison => "poison",
            DeadLetterKind::Fatal => "fatal",
        };

        let message = OutgoingMessage::new_json(&self.config.topics.dead_letter_queue, &record)?
            .with_key(Uuid::new_v4().to_string())
            .with_message_type("dead_letter")
            .with_header("original-topic", record.original_topic.as_str())
            .with_header("failure-kind", kind);

        self.send(message).await?;
        Ok(())
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new_json("test", &vec!["a", "b"])
            .unwrap()
            .with_key("my-key")
            .with_message_type("image_uploaded")
            .with_correlation_id("corr-123");

        assert_eq!(message.key, Some("my-key".to_string()));
        assert_eq!(message.headers.len(), 2);
        assert_eq!(message.payload, br#"["a","b"]"#.to_vec());
    }

    #[test]
    fn test_dead_letter_record_encodes_payload() {
        let record = DeadLetterRecord::new(
            DeadLetterKind::Poison,
            "pixtally.images.uploaded",
            3,
            42,
            b"not json",
            "invalid payload",
        );

        assert_eq!(record.payload_base64, "bm90IGpzb24=");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "poison");
        assert_eq!(json["offset"], 42);
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_dead_letter_record_keeps_details() {
        let record = DeadLetterRecord::new(DeadLetterKind::Fatal, "t", 0, 1, b"[]", "boom")
            .with_details(Some(serde_json::json!({"unapplied": 2})));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "fatal");
        assert_eq!(json["details"]["unapplied"], 2);
    }
}
