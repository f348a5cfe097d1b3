use crate::config::DatabaseConfig;
use crate::video::{NewVideo, Video};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors from the catalog store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Persistent home of video records
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Store a new record and return it with its generated id
    async fn insert(&self, video: NewVideo) -> Result<Video, StoreError>;

    /// Every record, newest first
    async fn find_all(&self) -> Result<Vec<Video>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Video>, StoreError>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Catalog store backed by PostgreSQL
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    /// Create a new store with a connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    #[instrument(skip(self, video), fields(title = %video.title))]
    async fn insert(&self, video: NewVideo) -> Result<Video, StoreError> {
        let video = sqlx::query_as::<_, Video>(
            r#"
            INSERT INTO videos (id, title, description, genre, age_rating, url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            RETURNING id, title, description, genre, age_rating, created_at, url
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&video.title)
        .bind(&video.description)
        .bind(&video.genre)
        .bind(video.age_rating)
        .bind(&video.url)
        .fetch_one(&self.pool)
        .await?;

        debug!(video_id = %video.id, "Video record inserted");
        Ok(video)
    }

    async fn find_all(&self) -> Result<Vec<Video>, StoreError> {
        let videos = sqlx::query_as::<_, Video>(
            r#"
            SELECT id, title, description, genre, age_rating, created_at, url
            FROM videos
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(videos)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Video>, StoreError> {
        let video = sqlx::query_as::<_, Video>(
            r#"
            SELECT id, title, description, genre, age_rating, created_at, url
            FROM videos
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(video)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Process-local catalog store for development and tests
#[derive(Default)]
pub struct InMemoryCatalogStore {
    videos: RwLock<Vec<Video>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn insert(&self, video: NewVideo) -> Result<Video, StoreError> {
        let video = video.into_video(Utc::now());
        self.videos.write().await.push(video.clone());
        Ok(video)
    }

    async fn find_all(&self) -> Result<Vec<Video>, StoreError> {
        let mut videos = self.videos.read().await.clone();
        // Stable sort keeps insertion order reversed for equal timestamps
        videos.reverse();
        videos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(videos)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Video>, StoreError> {
        Ok(self
            .videos
            .read()
            .await
            .iter()
            .find(|v| v.id == id)
            .cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
