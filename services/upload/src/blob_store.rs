use crate::config::S3Config;
use crate::validator;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("failed to write blob: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 upload failed: {0}")]
    S3(String),
}

/// Destination for uploaded image bytes
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` under the upload link and return its location
    async fn put(
        &self,
        upload_link_id: Uuid,
        file_name: &str,
        data: &[u8],
    ) -> Result<String, BlobStoreError>;

    /// Remove a blob by the location `put` returned; a missing blob is not an error
    async fn delete(&self, location: &str) -> Result<(), BlobStoreError>;
}

/// Writes blobs to `{root}/{upload_link_id}/{file_name}`
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(
        &self,
        upload_link_id: Uuid,
        file_name: &str,
        data: &[u8],
    ) -> Result<String, BlobStoreError> {
        let safe_name = sanitize_file_name(file_name)?;
        let dir = self.root.join(upload_link_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(safe_name);
        tokio::fs::write(&path, data).await?;

        debug!(path = %path.display(), "Blob written");
        Ok(path.to_string_lossy().into_owned())
    }

    async fn delete(&self, location: &str) -> Result<(), BlobStoreError> {
        match tokio::fs::remove_file(location).await {
            Ok(()) => {
                debug!(path = %location, "Blob removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes blobs to `{prefix}/{upload_link_id}/{file_name}` in one bucket
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    fn object_key(&self, upload_link_id: Uuid, safe_name: &str) -> String {
        object_key(&self.prefix, upload_link_id, safe_name)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(
        &self,
        upload_link_id: Uuid,
        file_name: &str,
        data: &[u8],
    ) -> Result<String, BlobStoreError> {
        let safe_name = sanitize_file_name(file_name)?;
        let key = self.object_key(upload_link_id, &safe_name);
        let content_type = validator::media_type(file_name)
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .content_type(content_type)
            .metadata("upload-link-id", upload_link_id.to_string())
            .send()
            .await
            .map_err(|e| BlobStoreError::S3(e.to_string()))?;

        debug!(key = %key, "Image uploaded to S3");
        Ok(key)
    }

    async fn delete(&self, location: &str) -> Result<(), BlobStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(location)
            .send()
            .await
            .map_err(|e| BlobStoreError::S3(e.to_string()))?;

        debug!(key = %location, "Image removed from S3");
        Ok(())
    }
}

fn object_key(prefix: &str, upload_link_id: Uuid, safe_name: &str) -> String {
    if prefix.is_empty() {
        format!("{upload_link_id}/{safe_name}")
    } else {
        format!("{prefix}/{upload_link_id}/{safe_name}")
    }
}

/// Bytes kept literally in stored names; everything else is percent-encoded
const NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Encode a client-supplied file name as one safe path component.
///
/// Separators, `%`, spaces and non-ASCII bytes are percent-encoded, as is a
/// leading dot, so the result can never be `.`, `..` or a hidden file.
/// Distinct names always encode to distinct components.
pub fn sanitize_file_name(name: &str) -> Result<String, BlobStoreError> {
    if name.is_empty() {
        return Err(BlobStoreError::InvalidName(name.to_string()));
    }

    let encoded = utf8_percent_encode(name, NAME_ENCODE_SET).to_string();
    Ok(match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{rest}"),
        None => encoded,
    })
}
