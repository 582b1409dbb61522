//! Upload request orchestration.
//!
//! One request goes through link check, in-request deduplication, validation
//! of every file, the duplicate check against stored images, blob writes with
//! metadata extraction, one bulk insert, and finally one aggregation event.

use crate::blob_store::{BlobStore, BlobStoreError};
use crate::metadata;
use crate::models::{IncomingFile, NewImage};
use crate::store::{ImageStore, UploadLinkStore};
use crate::validator::{self, ValidationError};
use axum::http::StatusCode;
use chrono::Utc;
use pixtally_pipeline::EventPublisher;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upload link not found")]
    LinkNotFound,

    #[error("upload link expired")]
    LinkExpired,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("no images uploaded")]
    NoImages,

    #[error("failed to store image: {0}")]
    Blob(#[from] BlobStoreError),

    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::LinkNotFound => StatusCode::NOT_FOUND,
            IngestError::LinkExpired => StatusCode::FORBIDDEN,
            IngestError::Invalid(_) | IngestError::NoImages => StatusCode::BAD_REQUEST,
            IngestError::Blob(_) | IngestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body; server-side causes stay in the logs
    pub fn public_message(&self) -> String {
        match self {
            IngestError::Blob(_) | IngestError::Store(_) => "failed to store images".to_string(),
            other => other.to_string(),
        }
    }
}

pub struct IngestionService {
    links: Arc<dyn UploadLinkStore>,
    images: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
    publisher: Arc<dyn EventPublisher>,
    publish_timeout: Duration,
}

impl IngestionService {
    pub fn new(
        links: Arc<dyn UploadLinkStore>,
        images: Arc<dyn ImageStore>,
        blobs: Arc<dyn BlobStore>,
        publisher: Arc<dyn EventPublisher>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            links,
            images,
            blobs,
            publisher,
            publish_timeout,
        }
    }

    /// Fail fast on an unknown or expired link, before the request body is read
    #[instrument(skip(self), fields(upload_link_id = %upload_link_id))]
    pub async fn check_link(&self, upload_link_id: Uuid) -> Result<(), IngestError> {
        observe(self.ensure_link_open(upload_link_id).await)
    }

    /// Store the request's new images and return their IDs
    #[instrument(skip(self, files), fields(upload_link_id = %upload_link_id, files = files.len()))]
    pub async fn handle(
        &self,
        upload_link_id: Uuid,
        files: Vec<IncomingFile>,
    ) -> Result<Vec<Uuid>, IngestError> {
        observe(self.ingest(upload_link_id, files).await)
    }

    async fn ensure_link_open(&self, upload_link_id: Uuid) -> Result<(), IngestError> {
        let link = self
            .links
            .get(upload_link_id)
            .await
            .map_err(IngestError::Store)?
            .ok_or(IngestError::LinkNotFound)?;

        if link.is_expired_at(Utc::now()) {
            return Err(IngestError::LinkExpired);
        }
        Ok(())
    }

    async fn ingest(
        &self,
        upload_link_id: Uuid,
        files: Vec<IncomingFile>,
    ) -> Result<Vec<Uuid>, IngestError> {
        // Checked again: the link may have expired while the body streamed in
        self.ensure_link_open(upload_link_id).await?;

        let files = dedupe_by_name(files);

        // Nothing is written unless every file is acceptable
        for file in &files {
            validator::validate(file)?;
        }

        let mut records = Vec::with_capacity(files.len());
        let mut written: Vec<String> = Vec::with_capacity(files.len());
        for file in files {
            let existing = self
                .images
                .find_by_name_and_link(upload_link_id, &file.file_name)
                .await
                .map_err(IngestError::Store)?;
            if existing.is_some() {
                debug!(name = %file.file_name, "Image already uploaded, skipping");
                metrics::counter!("uploads.images.duplicate").increment(1);
                continue;
            }

            let path = match self
                .blobs
                .put(upload_link_id, &file.file_name, &file.data)
                .await
            {
                Ok(path) => path,
                Err(e) => {
                    self.discard_blobs(&written).await;
                    return Err(e.into());
                }
            };
            written.push(path.clone());

            records.push(NewImage {
                metadata: metadata::extract(&file.data),
                name: file.file_name,
                upload_link_id,
                path,
                uploaded_at: Utc::now(),
            });
        }

        let attempted = records.len();
        let ids = if records.is_empty() {
            Vec::new()
        } else {
            match self.images.insert_many(records).await {
                Ok(ids) => ids,
                Err(e) => {
                    self.discard_blobs(&written).await;
                    return Err(IngestError::Store(e));
                }
            }
        };

        // Lost a race with a concurrent upload of the same name. Its blob
        // location is shared with the winner's record, so it stays.
        let conflicts = attempted - ids.len();
        if conflicts > 0 {
            metrics::counter!("uploads.images.duplicate").increment(conflicts as u64);
        }

        if ids.is_empty() {
            return Err(IngestError::NoImages);
        }

        metrics::counter!("uploads.images.stored").increment(ids.len() as u64);
        info!(stored = ids.len(), "Images stored");

        self.publish(&ids).await;
        Ok(ids)
    }

    /// Remove blobs no record points at; failures only leave an orphan behind
    async fn discard_blobs(&self, locations: &[String]) {
        for location in locations {
            if let Err(e) = self.blobs.delete(location).await {
                warn!(location = %location, error = %e, "Failed to remove orphaned blob");
                metrics::counter!("uploads.blobs.orphaned").increment(1);
            }
        }
    }

    /// Failures are logged and counted, never surfaced to the client
    async fn publish(&self, ids: &[Uuid]) {
        match tokio::time::timeout(self.publish_timeout, self.publisher.publish(ids)).await {
            Ok(Ok(())) => debug!(count = ids.len(), "Aggregation event published"),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to publish aggregation event");
                metrics::counter!("uploads.publish.failed").increment(1);
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "Publishing aggregation event timed out"
                );
                metrics::counter!("uploads.publish.failed").increment(1);
            }
        }
    }
}

/// Count and log a failed request by who is at fault
fn observe<T>(result: Result<T, IngestError>) -> Result<T, IngestError> {
    if let Err(ref e) = result {
        if e.status_code().is_client_error() {
            metrics::counter!("uploads.requests.rejected").increment(1);
            info!(reason = %e, "Upload rejected");
        } else {
            warn!(error = %e, "Upload failed");
        }
    }
    result
}

/// Keep the first file of each name
fn dedupe_by_name(files: Vec<IncomingFile>) -> Vec<IncomingFile> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|f| seen.insert(f.file_name.clone()))
        .collect()
}
