use crate::config::DatabaseConfig;
use crate::models::{Image, NewImage, StatisticCategory, StatisticCounter, UploadLink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadLinkStore: Send + Sync {
    async fn create(&self, expires_at: DateTime<Utc>) -> Result<UploadLink>;

    async fn get(&self, id: Uuid) -> Result<Option<UploadLink>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Image>>;

    /// Images for the given IDs; unknown IDs are absent from the result
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Image>>;

    async fn find_by_name_and_link(&self, upload_link_id: Uuid, name: &str)
        -> Result<Option<Image>>;

    /// Insert all records and return the IDs of the ones actually created,
    /// in input order. A record whose (upload link, name) already exists is
    /// dropped.
    async fn insert_many(&self, images: Vec<NewImage>) -> Result<Vec<Uuid>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn get(&self, category: StatisticCategory, name: &str)
        -> Result<Option<StatisticCounter>>;

    async fn insert(&self, counter: &StatisticCounter) -> Result<()>;

    /// Overwrite the count of an existing counter
    async fn update(&self, counter: &StatisticCounter) -> Result<()>;

    /// Highest counts first; ties in any order
    async fn top_by_count(
        &self,
        category: StatisticCategory,
        limit: i64,
    ) -> Result<Vec<StatisticCounter>>;

    /// Names in descending order, so day buckets come newest first
    async fn top_by_name(
        &self,
        category: StatisticCategory,
        limit: i64,
    ) -> Result<Vec<StatisticCounter>>;
}

/// Readiness check for the backing database
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

#[derive(FromRow)]
struct CounterRow {
    category: String,
    name: String,
    count: i64,
}

impl TryFrom<CounterRow> for StatisticCounter {
    type Error = anyhow::Error;

    fn try_from(row: CounterRow) -> Result<Self> {
        Ok(StatisticCounter {
            category: row.category.parse()?,
            name: row.name,
            count: row.count,
        })
    }
}

const IMAGE_COLUMNS: &str = "id, name, upload_link_id, path, width, height, latitude, longitude, \
                             camera_model, image_format, uploaded_at";

/// PostgreSQL-backed implementation of every store trait
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_counters(
        &self,
        sql: &str,
        category: StatisticCategory,
        limit: i64,
    ) -> Result<Vec<StatisticCounter>> {
        let rows = sqlx::query_as::<_, CounterRow>(sql)
            .bind(category.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query statistics")?;

        rows.into_iter().map(StatisticCounter::try_from).collect()
    }
}

#[async_trait]
impl UploadLinkStore for PgStore {
    #[instrument(skip(self))]
    async fn create(&self, expires_at: DateTime<Utc>) -> Result<UploadLink> {
        let link = UploadLink {
            id: Uuid::new_v4(),
            expires_at,
        };

        sqlx::query("INSERT INTO upload_links (id, expires_at) VALUES ($1, $2)")
            .bind(link.id)
            .bind(link.expires_at)
            .execute(&self.pool)
            .await
            .context("Failed to insert upload link")?;

        debug!(upload_link_id = %link.id, "Upload link created");
        Ok(link)
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadLink>> {
        sqlx::query_as::<_, UploadLink>("SELECT id, expires_at FROM upload_links WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query upload link")
    }
}

#[async_trait]
impl ImageStore for PgStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Image>> {
        sqlx::query_as::<_, Image>(&format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query image")
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Image>> {
        sqlx::query_as::<_, Image>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query images")
    }

    async fn find_by_name_and_link(
        &self,
        upload_link_id: Uuid,
        name: &str,
    ) -> Result<Option<Image>> {
        sqlx::query_as::<_, Image>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE upload_link_id = $1 AND name = $2"
        ))
        .bind(upload_link_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query image by name")
    }

    #[instrument(skip(self, images), fields(count = images.len()))]
    async fn insert_many(&self, images: Vec<NewImage>) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut inserted = Vec::with_capacity(images.len());

        for new_image in images {
            let image = new_image.into_image(Uuid::new_v4());

            let id: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO images (
                    id, name, upload_link_id, path, width, height,
                    latitude, longitude, camera_model, image_format, uploaded_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6,
                    $7, $8, $9, $10, $11
                )
                ON CONFLICT (upload_link_id, name) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(image.id)
            .bind(&image.name)
            .bind(image.upload_link_id)
            .bind(&image.path)
            .bind(image.width)
            .bind(image.height)
            .bind(image.latitude)
            .bind(image.longitude)
            .bind(&image.camera_model)
            .bind(&image.image_format)
            .bind(image.uploaded_at)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to insert image")?;

            match id {
                Some(id) => inserted.push(id),
                None => debug!(name = %image.name, "Image already uploaded, skipping"),
            }
        }

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(inserted)
    }
}

#[async_trait]
impl StatisticsStore for PgStore {
    async fn get(
        &self,
        category: StatisticCategory,
        name: &str,
    ) -> Result<Option<StatisticCounter>> {
        let row = sqlx::query_as::<_, CounterRow>(
            "SELECT category, name, count FROM statistics WHERE category = $1 AND name = $2",
        )
        .bind(category.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query statistic")?;

        row.map(StatisticCounter::try_from).transpose()
    }

    async fn insert(&self, counter: &StatisticCounter) -> Result<()> {
        sqlx::query("INSERT INTO statistics (category, name, count) VALUES ($1, $2, $3)")
            .bind(counter.category.as_str())
            .bind(&counter.name)
            .bind(counter.count)
            .execute(&self.pool)
            .await
            .context("Failed to insert statistic")?;
        Ok(())
    }

    async fn update(&self, counter: &StatisticCounter) -> Result<()> {
        let result =
            sqlx::query("UPDATE statistics SET count = $3 WHERE category = $1 AND name = $2")
                .bind(counter.category.as_str())
                .bind(&counter.name)
                .bind(counter.count)
                .execute(&self.pool)
                .await
                .context("Failed to update statistic")?;

        if result.rows_affected() == 0 {
            anyhow::bail!(
                "statistic {}/{} does not exist",
                counter.category,
                counter.name
            );
        }
        Ok(())
    }

    async fn top_by_count(
        &self,
        category: StatisticCategory,
        limit: i64,
    ) -> Result<Vec<StatisticCounter>> {
        self.fetch_counters(
            "SELECT category, name, count FROM statistics WHERE category = $1 \
             ORDER BY count DESC LIMIT $2",
            category,
            limit,
        )
        .await
    }

    async fn top_by_name(
        &self,
        category: StatisticCategory,
        limit: i64,
    ) -> Result<Vec<StatisticCounter>> {
        self.fetch_counters(
            "SELECT category, name, count FROM statistics WHERE category = $1 \
             ORDER BY name DESC LIMIT $2",
            category,
            limit,
        )
        .await
    }
}

#[async_trait]
impl HealthCheck for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}
