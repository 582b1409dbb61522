//! In-memory fakes for unit tests.

use crate::blob_store::{BlobStore, BlobStoreError};
use crate::models::{Image, NewImage, StatisticCategory, StatisticCounter, UploadLink};
use crate::store::{HealthCheck, ImageStore, StatisticsStore, UploadLinkStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use image::{ImageBuffer, ImageFormat, Rgb};
use pixtally_pipeline::{EventPublisher, ProducerError};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Mutex;
use uuid::Uuid;

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::new(width, height);
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn image_record(
    format: Option<&str>,
    camera_model: Option<&str>,
    uploaded_at: DateTime<Utc>,
) -> Image {
    Image {
        id: Uuid::new_v4(),
        name: format!("{}.img", Uuid::new_v4()),
        upload_link_id: Uuid::new_v4(),
        path: "mem://test".to_string(),
        width: 10,
        height: 10,
        latitude: None,
        longitude: None,
        camera_model: camera_model.map(str::to_string),
        image_format: format.map(str::to_string),
        uploaded_at,
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    links: Mutex<HashMap<Uuid, UploadLink>>,
    images: Mutex<Vec<Image>>,
    counters: Mutex<BTreeMap<(StatisticCategory, String), i64>>,
}

impl InMemoryStore {
    pub fn link_expiring_at(&self, expires_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.links
            .lock()
            .unwrap()
            .insert(id, UploadLink { id, expires_at });
        id
    }

    pub fn valid_link(&self) -> Uuid {
        self.link_expiring_at(Utc::now() + Duration::hours(1))
    }

    pub fn expired_link(&self) -> Uuid {
        self.link_expiring_at(Utc::now() - Duration::minutes(1))
    }

    pub fn link(&self, id: Uuid) -> Option<UploadLink> {
        self.links.lock().unwrap().get(&id).cloned()
    }

    pub fn add_image(&self, image: Image) -> Uuid {
        let id = image.id;
        self.images.lock().unwrap().push(image);
        id
    }

    pub fn image(&self, id: Uuid) -> Option<Image> {
        self.images
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().unwrap().len()
    }

    pub fn set_counter(&self, category: StatisticCategory, name: &str, count: i64) {
        self.counters
            .lock()
            .unwrap()
            .insert((category, name.to_string()), count);
    }

    pub fn counter(&self, category: StatisticCategory, name: &str) -> Option<i64> {
        self.counters
            .lock()
            .unwrap()
            .get(&(category, name.to_string()))
            .copied()
    }

    pub fn counter_count(&self) -> usize {
        self.counters.lock().unwrap().len()
    }

    fn counters_in(&self, category: StatisticCategory) -> Vec<StatisticCounter> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, _), _)| *c == category)
            .map(|((c, name), count)| StatisticCounter::new(*c, name.clone(), *count))
            .collect()
    }
}

#[async_trait]
impl UploadLinkStore for InMemoryStore {
    async fn create(&self, expires_at: DateTime<Utc>) -> Result<UploadLink> {
        let id = self.link_expiring_at(expires_at);
        Ok(UploadLink { id, expires_at })
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadLink>> {
        Ok(self.link(id))
    }
}

#[async_trait]
impl ImageStore for InMemoryStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Image>> {
        Ok(self.image(id))
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Image>> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .iter()
            .filter(|i| ids.contains(&i.id))
            .cloned()
            .collect())
    }

    async fn find_by_name_and_link(
        &self,
        upload_link_id: Uuid,
        name: &str,
    ) -> Result<Option<Image>> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.upload_link_id == upload_link_id && i.name == name)
            .cloned())
    }

    async fn insert_many(&self, images: Vec<NewImage>) -> Result<Vec<Uuid>> {
        let mut stored = self.images.lock().unwrap();
        let mut ids = Vec::new();
        for new_image in images {
            let taken = stored
                .iter()
                .any(|i| i.upload_link_id == new_image.upload_link_id && i.name == new_image.name);
            if taken {
                continue;
            }
            let image = new_image.into_image(Uuid::new_v4());
            ids.push(image.id);
            stored.push(image);
        }
        Ok(ids)
    }
}

#[async_trait]
impl StatisticsStore for InMemoryStore {
    async fn get(
        &self,
        category: StatisticCategory,
        name: &str,
    ) -> Result<Option<StatisticCounter>> {
        Ok(self
            .counter(category, name)
            .map(|count| StatisticCounter::new(category, name, count)))
    }

    async fn insert(&self, counter: &StatisticCounter) -> Result<()> {
        let mut counters = self.counters.lock().unwrap();
        let key = (counter.category, counter.name.clone());
        if counters.contains_key(&key) {
            anyhow::bail!("duplicate key {}/{}", counter.category, counter.name);
        }
        counters.insert(key, counter.count);
        Ok(())
    }

    async fn update(&self, counter: &StatisticCounter) -> Result<()> {
        let mut counters = self.counters.lock().unwrap();
        match counters.get_mut(&(counter.category, counter.name.clone())) {
            Some(count) => {
                *count = counter.count;
                Ok(())
            }
            None => anyhow::bail!("missing key {}/{}", counter.category, counter.name),
        }
    }

    async fn top_by_count(
        &self,
        category: StatisticCategory,
        limit: i64,
    ) -> Result<Vec<StatisticCounter>> {
        let mut counters = self.counters_in(category);
        counters.sort_by(|a, b| b.count.cmp(&a.count));
        counters.truncate(limit as usize);
        Ok(counters)
    }

    async fn top_by_name(
        &self,
        category: StatisticCategory,
        limit: i64,
    ) -> Result<Vec<StatisticCounter>> {
        let mut counters = self.counters_in(category);
        counters.sort_by(|a, b| b.name.cmp(&a.name));
        counters.truncate(limit as usize);
        Ok(counters)
    }
}

#[async_trait]
impl HealthCheck for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Blobs keyed by the location `put` hands out
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn get(&self, upload_link_id: Uuid, name: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&Self::location(upload_link_id, name))
            .cloned()
    }

    fn location(upload_link_id: Uuid, name: &str) -> String {
        format!("mem://{upload_link_id}/{name}")
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(
        &self,
        upload_link_id: Uuid,
        file_name: &str,
        data: &[u8],
    ) -> Result<String, BlobStoreError> {
        let location = Self::location(upload_link_id, file_name);
        self.blobs
            .lock()
            .unwrap()
            .insert(location.clone(), data.to_vec());
        Ok(location)
    }

    async fn delete(&self, location: &str) -> Result<(), BlobStoreError> {
        self.blobs.lock().unwrap().remove(location);
        Ok(())
    }
}

#[derive(Default, Clone, Copy)]
enum PublishMode {
    #[default]
    Deliver,
    Fail,
    Hang,
}

#[derive(Default)]
pub struct RecordingPublisher {
    mode: PublishMode,
    events: Mutex<Vec<Vec<Uuid>>>,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            mode: PublishMode::Fail,
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            mode: PublishMode::Hang,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<Vec<Uuid>> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, image_ids: &[Uuid]) -> Result<(), ProducerError> {
        match self.mode {
            PublishMode::Deliver => {
                self.events.lock().unwrap().push(image_ids.to_vec());
                Ok(())
            }
            PublishMode::Fail => Err(ProducerError::SendError {
                topic: "pixtally.images.uploaded".to_string(),
                message: "broker unavailable".to_string(),
            }),
            PublishMode::Hang => std::future::pending().await,
        }
    }
}
