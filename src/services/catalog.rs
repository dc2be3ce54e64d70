//! src/services/catalog.rs
//!
//! Catalog registration: the hand-off point where an ingested upload becomes
//! a video the rest of the system can see.

use crate::models::{
    transcode::MANIFEST_FILE_NAME,
    video::{VideoId, VideoRecord},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{path::Path, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_DESCRIPTION: &str = "Uploaded via chunk upload";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog rejected registration: {0}")]
    Rejected(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// A published video, as the catalog needs to hear about it.
#[derive(Debug, Clone)]
pub struct NewVideo<'a> {
    /// Upload the video came from. Registering the same upload twice must
    /// yield the first record.
    pub upload_id: &'a str,
    pub owner: &'a str,
    pub file_path: &'a Path,
    pub display_name: &'a str,
    /// HLS output directory, when transcoding produced one.
    pub stream_dir: Option<&'a Path>,
}

/// External collaborator that owns video records.
///
/// Implementations must be idempotent per [`NewVideo::upload_id`]; a pipeline
/// interrupted after registration registers again on retry.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn create_video_record(&self, video: NewVideo<'_>) -> Result<VideoId, CatalogError>;
}

/// Catalog stored in the service's own SQLite database.
#[derive(Clone)]
pub struct SqliteCatalog {
    db: Arc<SqlitePool>,
}

impl SqliteCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: VideoId) -> Result<Option<VideoRecord>, CatalogError> {
        let record = sqlx::query_as::<_, VideoRecord>(
            "SELECT id, upload_id, owner, title, description, file_path, manifest_path, created_at
             FROM videos WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn create_video_record(&self, video: NewVideo<'_>) -> Result<VideoId, CatalogError> {
        if video.display_name.trim().is_empty() {
            return Err(CatalogError::Rejected("empty title".into()));
        }

        let manifest = video
            .stream_dir
            .map(|dir| dir.join(MANIFEST_FILE_NAME).to_string_lossy().into_owned());

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO videos
                (id, upload_id, owner, title, description, file_path, manifest_path, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(upload_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(video.upload_id)
        .bind(video.owner)
        .bind(video.display_name)
        .bind(DEFAULT_DESCRIPTION)
        .bind(video.file_path.to_string_lossy().into_owned())
        .bind(manifest)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let id: VideoId = sqlx::query_scalar("SELECT id FROM videos WHERE upload_id = ?")
            .bind(video.upload_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(id)
    }
}
