//! Statistics aggregation.
//!
//! Turns one aggregation event (a list of image IDs) into counter deltas and
//! applies them one at a time. Everything that can fail before the first
//! counter write is retryable or poison; once writing has started, a write
//! that exhausts its retries makes the message fatal and reports the deltas
//! still outstanding, so nothing is silently applied twice.

use crate::models::{day_bucket, Image, StatisticCategory, StatisticCounter};
use crate::store::{ImageStore, StatisticsStore};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use pixtally_pipeline::{HandlerError, ImageUploadedEvent, IncomingMessage, MessageHandler, RetryPolicy};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Increment for one counter key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterDelta {
    pub category: StatisticCategory,
    pub name: String,
    pub delta: i64,
}

/// Per-key increments for a set of images, ordered by category then name.
/// Each image adds one to every category it has a value for.
pub fn tally(images: &[Image]) -> Vec<CounterDelta> {
    let mut counts: BTreeMap<(StatisticCategory, String), i64> = BTreeMap::new();

    for image in images {
        if let Some(format) = non_empty(image.image_format.as_deref()) {
            *counts
                .entry((StatisticCategory::ImageFormat, format.to_string()))
                .or_default() += 1;
        }
        if let Some(model) = non_empty(image.camera_model.as_deref()) {
            *counts
                .entry((StatisticCategory::CameraModel, model.to_string()))
                .or_default() += 1;
        }
        *counts
            .entry((StatisticCategory::DayBucket, day_bucket(image.uploaded_at)))
            .or_default() += 1;
    }

    counts
        .into_iter()
        .map(|((category, name), delta)| CounterDelta {
            category,
            name,
            delta,
        })
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Create the counter with `delta`, or add `delta` to the existing count
pub async fn apply_delta(store: &dyn StatisticsStore, delta: &CounterDelta) -> anyhow::Result<()> {
    match store.get(delta.category, &delta.name).await? {
        None => {
            store
                .insert(&StatisticCounter::new(delta.category, delta.name.clone(), delta.delta))
                .await?;
            metrics::counter!("aggregation.counters.created").increment(1);
        }
        Some(mut counter) => {
            counter.count += delta.delta;
            store.update(&counter).await?;
            metrics::counter!("aggregation.counters.updated").increment(1);
        }
    }
    Ok(())
}

/// Message handler for the aggregation consumer
pub struct AggregationHandler {
    images: Arc<dyn ImageStore>,
    statistics: Arc<dyn StatisticsStore>,
    retry: RetryPolicy,
    op_timeout: Duration,
}

impl AggregationHandler {
    pub fn new(
        images: Arc<dyn ImageStore>,
        statistics: Arc<dyn StatisticsStore>,
        retry: RetryPolicy,
        op_timeout: Duration,
    ) -> Self {
        Self {
            images,
            statistics,
            retry,
            op_timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| anyhow!("{what} timed out after {:?}", self.op_timeout))?
    }

    /// Resolve every ID or fail; a missing image makes the whole message poison
    async fn resolve(&self, ids: &[Uuid]) -> Result<Vec<Image>, HandlerError> {
        let images = self
            .bounded("image lookup", self.images.get_by_ids(ids))
            .await
            .context("failed to look up images")
            .map_err(HandlerError::Retryable)?;

        let found: HashSet<Uuid> = images.iter().map(|i| i.id).collect();
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !found.contains(id))
            .map(Uuid::to_string)
            .collect();

        if !missing.is_empty() {
            return Err(HandlerError::poison(anyhow!(
                "referenced images not found: {}",
                missing.join(", ")
            )));
        }
        Ok(images)
    }

    async fn apply_with_retry(&self, delta: &CounterDelta) -> anyhow::Result<()> {
        let mut backoff = self.retry.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = self
                .bounded("counter write", apply_delta(self.statistics.as_ref(), delta))
                .await;

            let e = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempts >= self.retry.max_attempts {
                return Err(e.context(format!("gave up after {attempts} attempts")));
            }
            let Some(delay) = backoff.next_backoff() else {
                return Err(e.context("retry schedule exhausted"));
            };

            warn!(
                category = %delta.category,
                name = %delta.name,
                attempt = attempts,
                error = %format!("{e:#}"),
                "Counter write failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MessageHandler for AggregationHandler {
    #[instrument(skip(self, message), fields(offset = message.metadata.offset))]
    async fn handle(&self, message: &IncomingMessage) -> Result<(), HandlerError> {
        let event = ImageUploadedEvent::decode(&message.payload)
            .map_err(|e| HandlerError::poison(anyhow!(e).context("undecodable aggregation event")))?;

        if event.is_empty() {
            debug!("Empty aggregation event, nothing to count");
            return Ok(());
        }

        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = event
            .image_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();

        let images = self.resolve(&ids).await?;
        let deltas = tally(&images);

        for (applied, delta) in deltas.iter().enumerate() {
            if let Err(e) = self.apply_with_retry(delta).await {
                let details = serde_json::json!({
                    "image_ids": ids,
                    "unapplied": &deltas[applied..],
                });
                return Err(HandlerError::fatal_with_details(
                    e.context(format!("failed to apply {}/{}", delta.category, delta.name)),
                    details,
                ));
            }
        }

        info!(images = images.len(), counters = deltas.len(), "Statistics updated");
        Ok(())
    }
}
