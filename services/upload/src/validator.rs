//! Per-file acceptance rules for uploads.

use crate::models::IncomingFile;
use mime_guess::mime;
use thiserror::Error;

/// Largest accepted image, in bytes
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file too large: {size} bytes (max: {limit} bytes)")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported file type for {filename}: {}", media_type.as_deref().unwrap_or("unknown"))]
    UnsupportedType {
        filename: String,
        media_type: Option<String>,
    },
}

/// Media type guessed from the file extension
pub fn media_type(file_name: &str) -> Option<mime::Mime> {
    mime_guess::from_path(file_name).first()
}

/// Reject files that are too large or whose extension is not an image type
pub fn validate(file: &IncomingFile) -> Result<(), ValidationError> {
    if file.size() > MAX_IMAGE_BYTES {
        return Err(ValidationError::TooLarge {
            size: file.size(),
            limit: MAX_IMAGE_BYTES,
        });
    }

    match media_type(&file.file_name) {
        Some(m) if m.type_() == mime::IMAGE => Ok(()),
        other => Err(ValidationError::UnsupportedType {
            filename: file.file_name.clone(),
            media_type: other.map(|m| m.essence_str().to_string()),
        }),
    }
}
