//! Pixtally Pipeline - Kafka message pipeline for image upload statistics
//!
//! The upload service publishes one [`ImageUploadedEvent`] per successful
//! upload request. The aggregation worker consumes those events, folds them
//! into statistics counters and commits only after the counters are written.
//!
//! # Example
//!
//! ```rust,no_run
//! use pixtally_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! # struct Noop;
//! # #[async_trait]
//! # impl MessageHandler for Noop {
//! #     async fn handle(&self, _: &IncomingMessage) -> Result<(), HandlerError> { Ok(()) }
//! # }
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::new("localhost:9092");
//!     let producer = Arc::new(KafkaProducer::new(config.clone())?);
//!     let source = Arc::new(KafkaMessageSource::new(&config)?);
//!
//!     let consumer = EventConsumer::new(source, Arc::new(Noop), config.retry_policy())
//!         .with_dead_letters(producer);
//!     consumer.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod events;
pub mod producer;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, RetryPolicy, SaslConfig,
    SaslMechanism, SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{
    ConsumerError, ConsumerState, EventConsumer, HandlerError, IncomingMessage,
    KafkaMessageSource, MessageHandler, MessageMetadata, MessageSource,
};
pub use events::ImageUploadedEvent;
pub use producer::{
    DeadLetterKind, DeadLetterRecord, DeadLetterSink, DeliveryResult, EventPublisher,
    KafkaProducer, OutgoingMessage, ProducerError,
};

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{
        EventConsumer, HandlerError, IncomingMessage, KafkaMessageSource, MessageHandler,
        MessageSource,
    };
    pub use crate::events::ImageUploadedEvent;
    pub use crate::producer::{DeadLetterSink, EventPublisher, KafkaProducer, ProducerError};
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
