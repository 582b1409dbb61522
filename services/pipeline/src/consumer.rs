//! Kafka consumer for the Pixtally pipeline.
//!
//! [`EventConsumer`] drives one worker through Fetch → Handle → Commit. A
//! message is committed only after its handler succeeded, or after it was
//! classified as poison and written to the dead letter topic. A fatal
//! message is dead-lettered and not committed itself, but a later commit on
//! the same partition moves past it, so the dead letter topic is where it
//! survives. Handler
//! failures are tagged (see [`HandlerError`]) so transient errors are retried
//! with backoff and a bad message never stops the worker.

use crate::config::{KafkaConfig, RetryPolicy};
use crate::producer::{DeadLetterKind, DeadLetterRecord, DeadLetterSink};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors raised by the message source itself
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),
}

/// Tagged handler failure.
///
/// Display uses the alternate anyhow format so the whole context chain ends
/// up in logs and dead-letter records.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient; nothing was written, so the message may be handled again
    #[error("retryable: {0:#}")]
    Retryable(anyhow::Error),

    /// The message can never succeed; dead-letter it and commit
    #[error("poison message: {0:#}")]
    Poison(anyhow::Error),

    /// Handling failed permanently; dead-letter it and skip the commit.
    ///
    /// Skipping the commit does not guarantee redelivery: the next committed
    /// offset on the same partition acknowledges this message too. The dead
    /// letter record is what preserves it.
    #[error("fatal: {error:#}")]
    Fatal {
        error: anyhow::Error,
        details: Option<serde_json::Value>,
    },
}

impl HandlerError {
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(error.into())
    }

    pub fn poison(error: impl Into<anyhow::Error>) -> Self {
        Self::Poison(error.into())
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self::Fatal {
            error: error.into(),
            details: None,
        }
    }

    pub fn fatal_with_details(error: impl Into<anyhow::Error>, details: serde_json::Value) -> Self {
        Self::Fatal {
            error: error.into(),
            details: Some(details),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Metadata about a received message
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header("correlation-id")
    }
}

/// Inbound side of the message channel
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next message
    async fn fetch(&self) -> Result<IncomingMessage, ConsumerError>;

    /// Acknowledge a message so it is not delivered to the group again
    async fn commit(&self, message: &IncomingMessage) -> Result<(), ConsumerError>;
}

/// Handler trait for processing messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), HandlerError>;
}

/// [`MessageSource`] backed by an rdkafka stream consumer with manual commits
pub struct KafkaMessageSource {
    consumer: StreamConsumer,
}

impl KafkaMessageSource {
    /// Create a consumer in the configured group and subscribe to the
    /// image-uploaded topic
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.topics.image_uploaded.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        info!(topic = %config.topics.image_uploaded, "Subscribed to Kafka topic");

        Ok(Self { consumer })
    }

    fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
        let payload = msg.payload().unwrap_or(&[]).to_vec();
        let key = msg.key().map(|k| k.to_vec());

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(value) = header.value {
                    if let Ok(v) = String::from_utf8(value.to_vec()) {
                        headers.insert(header.key.to_string(), v);
                    }
                }
            }
        }

        IncomingMessage {
            payload,
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key,
                timestamp: msg.timestamp().to_millis(),
                headers,
            },
        }
    }
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn fetch(&self) -> Result<IncomingMessage, ConsumerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| ConsumerError::PollError(e.to_string()))?;

        Ok(Self::convert_message(&message))
    }

    async fn commit(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        let mut partitions = TopicPartitionList::new();
        partitions
            .add_partition_offset(
                &message.metadata.topic,
                message.metadata.partition,
                Offset::Offset(message.metadata.offset + 1),
            )
            .map_err(|e| ConsumerError::CommitError(e.to_string()))?;

        self.consumer
            .commit(&partitions, CommitMode::Async)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }
}

/// Where the worker currently is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Fetching,
    Handling,
    Committing,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Fetching => "fetching",
            ConsumerState::Handling => "handling",
            ConsumerState::Committing => "committing",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Single aggregation worker: Fetch → Handle → Commit until cancelled
pub struct EventConsumer<S, H> {
    source: Arc<S>,
    handler: Arc<H>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    retry: RetryPolicy,
    state: watch::Sender<ConsumerState>,
}

impl<S, H> EventConsumer<S, H>
where
    S: MessageSource,
    H: MessageHandler,
{
    pub fn new(source: Arc<S>, handler: Arc<H>, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            source,
            handler,
            dead_letters: None,
            retry,
            state,
        }
    }

    /// Set the dead letter destination
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConsumerState) {
        self.state.send_replace(next);
    }

    /// Run until `cancel` fires. Cancellation is only observed while waiting
    /// for the next message; a message being handled or committed always
    /// finishes first.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting aggregation consumer loop");

        loop {
            self.transition(ConsumerState::Fetching);

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    error!("Consumer cancelled while fetching, stopping");
                    self.transition(ConsumerState::Stopped);
                    return;
                }
                fetched = self.source.fetch() => fetched,
            };

            let message = match fetched {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Failed to fetch message");
                    metrics::counter!("aggregation.fetch.errors").increment(1);
                    self.transition(ConsumerState::Idle);
                    continue;
                }
            };

            self.process(message).await;
            self.transition(ConsumerState::Idle);
        }
    }

    #[instrument(
        skip(self, message),
        fields(
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            correlation_id = message.correlation_id()
        )
    )]
    async fn process(&self, message: IncomingMessage) {
        self.transition(ConsumerState::Handling);
        debug!(size_bytes = message.payload.len(), "Handling message");

        let started = Instant::now();
        let result = self.handle_with_retry(&message).await;
        metrics::histogram!("aggregation.handle.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.commit(&message).await;
                metrics::counter!("aggregation.messages.processed").increment(1);
            }
            Err(HandlerError::Poison(e)) => {
                warn!(error = %format!("{e:#}"), "Poison message, dead-lettering and committing");
                metrics::counter!("aggregation.messages.poison").increment(1);
                let record = self.dead_letter_record(&message, DeadLetterKind::Poison, &e, None);
                self.send_dead_letter(record).await;
                self.commit(&message).await;
            }
            Err(HandlerError::Fatal { error: e, details }) => {
                self.fail(&message, e, details).await;
            }
            Err(HandlerError::Retryable(e)) => {
                self.fail(&message, e, None).await;
            }
        }
    }

    async fn fail(
        &self,
        message: &IncomingMessage,
        error: anyhow::Error,
        details: Option<serde_json::Value>,
    ) {
        error!(error = %format!("{error:#}"), "Message handling failed, skipping commit");
        metrics::counter!("aggregation.messages.fatal").increment(1);
        let record = self.dead_letter_record(message, DeadLetterKind::Fatal, &error, details);
        self.send_dead_letter(record).await;
    }

    /// Retry retryable failures with exponential backoff; exhaustion becomes fatal
    async fn handle_with_retry(&self, message: &IncomingMessage) -> Result<(), HandlerError> {
        let mut backoff = self.retry.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.handler.handle(message).await {
                Err(HandlerError::Retryable(e)) => {
                    if attempts >= self.retry.max_attempts {
                        return Err(HandlerError::fatal(
                            e.context(format!("gave up after {attempts} attempts")),
                        ));
                    }

                    let Some(delay) = backoff.next_backoff() else {
                        return Err(HandlerError::fatal(e.context("retry schedule exhausted")));
                    };

                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{e:#}"),
                        "Handling failed, retrying"
                    );
                    metrics::counter!("aggregation.messages.retried").increment(1);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn commit(&self, message: &IncomingMessage) {
        self.transition(ConsumerState::Committing);
        if let Err(e) = self.source.commit(message).await {
            warn!(error = %e, "Failed to commit offset");
            metrics::counter!("aggregation.commit.errors").increment(1);
        }
    }

    fn dead_letter_record(
        &self,
        message: &IncomingMessage,
        kind: DeadLetterKind,
        error: &anyhow::Error,
        details: Option<serde_json::Value>,
    ) -> DeadLetterRecord {
        DeadLetterRecord::new(
            kind,
            message.metadata.topic.as_str(),
            message.metadata.partition,
            message.metadata.offset,
            &message.payload,
            format!("{error:#}"),
        )
        .with_details(details)
    }

    async fn send_dead_letter(&self, record: DeadLetterRecord) {
        let Some(ref sink) = self.dead_letters else {
            warn!(kind = ?record.kind, "No dead letter sink configured, dropping record");
            return;
        };

        if let Err(e) = sink.dead_letter(record).await {
            error!(error = %e, "Failed to write dead letter record");
            metrics::counter!("aggregation.dead_letter.errors").increment(1);
        }
    }
}
