//! Records shared by the upload path, the stores and the aggregation handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Time-limited permission to upload images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UploadLink {
    pub id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl UploadLink {
    /// A link whose expiration is at or before `now` no longer accepts uploads
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Stored image record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "uploadLinkID")]
    pub upload_link_id: Uuid,
    /// Blob store location
    pub path: String,
    #[serde(rename = "imageWidth")]
    pub width: i32,
    #[serde(rename = "imageHeight")]
    pub height: i32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(rename = "cameraModel")]
    pub camera_model: Option<String>,
    #[serde(rename = "imageFormat")]
    pub image_format: Option<String>,
    #[serde(rename = "uploadTime")]
    pub uploaded_at: DateTime<Utc>,
}

/// Image record before the store assigns its ID
#[derive(Debug, Clone, PartialEq)]
pub struct NewImage {
    pub name: String,
    pub upload_link_id: Uuid,
    pub path: String,
    pub metadata: ImageMetadata,
    pub uploaded_at: DateTime<Utc>,
}

impl NewImage {
    pub fn into_image(self, id: Uuid) -> Image {
        Image {
            id,
            name: self.name,
            upload_link_id: self.upload_link_id,
            path: self.path,
            width: clamp_dimension(self.metadata.width),
            height: clamp_dimension(self.metadata.height),
            latitude: self.metadata.latitude,
            longitude: self.metadata.longitude,
            camera_model: self.metadata.camera_model,
            image_format: self.metadata.format,
            uploaded_at: self.uploaded_at,
        }
    }
}

/// Postgres has no unsigned integers
pub fn clamp_dimension(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// What the image bytes say about themselves. Every field is best effort.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub camera_model: Option<String>,
    /// Upper-case format tag, e.g. `JPEG`
    pub format: Option<String>,
}

/// One file from a multipart upload
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

impl IncomingFile {
    pub fn new(file_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Statistic counter family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatisticCategory {
    ImageFormat,
    CameraModel,
    DayBucket,
}

impl StatisticCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticCategory::ImageFormat => "image-format",
            StatisticCategory::CameraModel => "camera-model",
            StatisticCategory::DayBucket => "day-bucket",
        }
    }
}

impl fmt::Display for StatisticCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown statistic category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for StatisticCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image-format" => Ok(StatisticCategory::ImageFormat),
            "camera-model" => Ok(StatisticCategory::CameraModel),
            "day-bucket" => Ok(StatisticCategory::DayBucket),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// Running count for one (category, name) key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticCounter {
    #[serde(skip)]
    pub category: StatisticCategory,
    pub name: String,
    pub count: i64,
}

impl StatisticCounter {
    pub fn new(category: StatisticCategory, name: impl Into<String>, count: i64) -> Self {
        Self {
            category,
            name: name.into(),
            count,
        }
    }
}

/// Calendar day (UTC) an upload is counted under
pub fn day_bucket(uploaded_at: DateTime<Utc>) -> String {
    uploaded_at.format("%Y-%m-%d").to_string()
}
