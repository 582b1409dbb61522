//! Aggregation event payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// IDs of images stored by one upload request, in insertion order.
///
/// Travels as a bare JSON array, e.g. `["7f1c...", "a93e..."]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageUploadedEvent {
    pub image_ids: Vec<Uuid>,
}

impl ImageUploadedEvent {
    pub fn new(image_ids: Vec<Uuid>) -> Self {
        Self { image_ids }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }
}
