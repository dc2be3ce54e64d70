//! Represents a published video in the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Identifier handed back by the catalog for a registered video.
pub type VideoId = Uuid;

/// A video that finished ingestion and is visible to the rest of the system.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct VideoRecord {
    pub id: Uuid,

    /// Upload the video was ingested from; registration is keyed on it.
    pub upload_id: String,

    /// Uploader that owns the video.
    pub owner: String,

    pub title: String,

    pub description: String,

    /// Path of the assembled source file.
    pub file_path: String,

    /// HLS manifest produced by the transcoder, if known.
    pub manifest_path: Option<String>,

    pub created_at: DateTime<Utc>,
}
