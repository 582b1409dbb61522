//! Pixtally Upload Service
//!
//! Accepts image uploads through expiring upload links, records each image's
//! metadata in PostgreSQL and keeps per-category usage statistics up to date.
//!
//! ## Features
//!
//! - **Upload Links**: Secret-protected endpoint issuing time-limited upload URLs
//! - **Image Ingestion**: Multipart uploads are validated, written to a blob
//!   store (local disk or S3) and indexed with their extracted metadata
//! - **Statistics Aggregation**: An image-uploaded event is published per
//!   request; a Kafka consumer folds each batch into the statistics counters
//! - **Statistics API**: Most popular formats, camera models and daily volume
//!
//! ## Architecture
//!
//! ```text
//!  HTTP                  Blob store            PostgreSQL
//! ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//! │ Upload       │─────▶│ {link}/      │      │ upload_links │
//! │ Endpoint     │      │   {file}     │      │ images       │
//! └──────────────┘      └──────────────┘      │ statistics   │
//!        │                                    └──────────────┘
//!        │ image ids                                 ▲
//!        ▼                                           │
//! ┌──────────────┐      ┌──────────────┐             │
//! │ Kafka        │─────▶│ Aggregation  │─────────────┘
//! │ Topic        │      │ Consumer     │
//! └──────────────┘      └──────────────┘
//! ```

pub mod aggregation;
pub mod api;
pub mod auth;
pub mod blob_store;
pub mod config;
pub mod ingestion;
pub mod metadata;
pub mod models;
pub mod store;
pub mod validator;

#[cfg(test)]
mod testing;

pub use aggregation::{tally, AggregationHandler, CounterDelta};
pub use api::{create_router, start_api_server, AppState, StatisticsResponse};
pub use auth::{CredentialStore, Principal, StaticCredentialStore, SECRET_HEADER};
pub use blob_store::{BlobStore, BlobStoreError, LocalBlobStore, S3BlobStore};
pub use config::Config;
pub use ingestion::{IngestError, IngestionService};
pub use models::{
    Image, ImageMetadata, IncomingFile, NewImage, StatisticCategory, StatisticCounter, UploadLink,
};
pub use store::{HealthCheck, ImageStore, PgStore, StatisticsStore, UploadLinkStore};
pub use validator::{ValidationError, MAX_IMAGE_BYTES};
