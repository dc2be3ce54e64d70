//! Upload sessions: the durable record of one logical file upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{collections::BTreeSet, fmt};
use uuid::Uuid;

/// Where an upload is in the ingestion pipeline.
///
/// `receiving -> complete -> assembling -> transcoding -> registering`, after
/// which the session is replaced by a [`PublishedUpload`] tombstone. `failed` is reachable only from
/// the three pipeline stages and remembers which one broke in
/// [`UploadSession::failed_stage`].
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum UploadStage {
    Receiving,
    Complete,
    Assembling,
    Transcoding,
    Registering,
    Failed,
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStage::Receiving => "receiving",
            UploadStage::Complete => "complete",
            UploadStage::Assembling => "assembling",
            UploadStage::Transcoding => "transcoding",
            UploadStage::Registering => "registering",
            UploadStage::Failed => "failed",
        }
    }

    /// Stages that run inside a background pipeline task.
    pub fn is_pipeline_stage(&self) -> bool {
        matches!(
            self,
            UploadStage::Assembling | UploadStage::Transcoding | UploadStage::Registering
        )
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upload in progress (or parked in `failed`).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Client-supplied opaque identifier, also the staging directory name.
    pub upload_id: String,

    /// Display name of the final file, fixed by the first chunk.
    pub file_name: String,

    /// Uploader identity as reported by the edge.
    pub owner: String,

    /// Declared number of chunks; indices are `0..total_chunks`.
    pub total_chunks: i64,

    /// Number of distinct indices received so far.
    pub received_count: i64,

    /// Monotonic: becomes true exactly once, when every index has arrived.
    pub is_complete: bool,

    pub stage: UploadStage,

    /// Pipeline stage that failed, when `stage == Failed`.
    pub failed_stage: Option<UploadStage>,

    /// Human-readable reason for the last pipeline failure.
    pub last_error: Option<String>,

    /// Assembled file, kept across transcode/registration failures.
    pub assembled_path: Option<String>,

    /// HLS output directory once transcoding succeeded.
    pub output_dir: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Indices persisted so far; loaded from `upload_chunks`.
    #[sqlx(skip)]
    pub received_chunks: BTreeSet<u32>,
}

impl UploadSession {
    /// Chunk indices in `0..total_chunks` not yet received.
    pub fn missing_chunks(&self) -> Vec<u32> {
        let total = u32::try_from(self.total_chunks).unwrap_or(0);
        (0..total)
            .filter(|idx| !self.received_chunks.contains(idx))
            .collect()
    }
}

/// What the ledger returns for one recorded chunk.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub session: UploadSession,

    /// True for exactly one caller per upload: the one whose chunk completed it.
    pub newly_complete: bool,

    /// The chunk arrived after completion and was not recorded.
    pub after_completion: bool,
}

/// Tombstone left behind when a session is retired by a successful publish.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PublishedUpload {
    pub upload_id: String,
    pub video_id: Uuid,
    pub total_chunks: i64,
    pub published_at: DateTime<Utc>,
}
