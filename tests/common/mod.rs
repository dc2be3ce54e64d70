#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;
use video_ingest::{
    db,
    models::video::VideoId,
    services::{
        assembler::{Assembler, CollisionPolicy},
        catalog::{Catalog, CatalogError, NewVideo},
        chunk_store::{ChunkReceipt, ChunkStore},
        coordinator::{ChunkMeta, IngestionCoordinator},
        transcoder::{TranscodeError, Transcoder},
        upload_ledger::UploadLedger,
    },
    state::AppState,
};

/// Transcoder double: writes a one-line manifest and counts invocations.
#[derive(Default)]
pub struct FakeTranscoder {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(&self, input: &Path) -> Result<PathBuf, TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TranscodeError::Failed {
                exit_code: Some(1),
                stderr_excerpt: "Invalid data found when processing input".into(),
            });
        }
        let out = input.with_extension("");
        tokio::fs::create_dir_all(&out).await?;
        tokio::fs::write(out.join("index.m3u8"), b"#EXTM3U\n").await?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct Registered {
    pub video_id: VideoId,
    pub upload_id: String,
    pub owner: String,
    pub file_path: PathBuf,
    pub display_name: String,
    pub stream_dir: Option<PathBuf>,
}

/// Catalog double: records registrations once per upload, optionally rejects them.
#[derive(Default)]
pub struct FakeCatalog {
    pub records: Mutex<Vec<Registered>>,
    pub reject: AtomicBool,
}

impl FakeCatalog {
    pub fn registered(&self) -> Vec<Registered> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn create_video_record(&self, video: NewVideo<'_>) -> Result<VideoId, CatalogError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(CatalogError::Rejected("catalog unavailable".into()));
        }
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.iter().find(|r| r.upload_id == video.upload_id) {
            return Ok(existing.video_id);
        }
        let video_id = uuid::Uuid::new_v4();
        records.push(Registered {
            video_id,
            upload_id: video.upload_id.to_string(),
            owner: video.owner.to_string(),
            file_path: video.file_path.to_path_buf(),
            display_name: video.display_name.to_string(),
            stream_dir: video.stream_dir.map(Path::to_path_buf),
        });
        Ok(video_id)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub policy: CollisionPolicy,
    pub coordinator: IngestionCoordinator,
    pub chunks: ChunkStore,
    pub ledger: UploadLedger,
    pub transcoder: Arc<FakeTranscoder>,
    pub catalog: Arc<FakeCatalog>,
    pub db: Arc<sqlx::SqlitePool>,
}

impl Harness {
    pub async fn new(policy: CollisionPolicy) -> Self {
        let dir = TempDir::new().unwrap();
        let chunk_root = dir.path().join("chunks");
        let video_root = dir.path().join("videos");
        std::fs::create_dir_all(&chunk_root).unwrap();
        std::fs::create_dir_all(&video_root).unwrap();

        let url = format!("sqlite://{}", dir.path().join("ingest.db").display());
        let db = Arc::new(db::connect(&url, 4).await.unwrap());
        db::run_migrations(&db).await.unwrap();

        let chunks = ChunkStore::new(&chunk_root);
        let ledger = UploadLedger::new(db.clone());
        let assembler = Assembler::new(chunks.clone(), &video_root, policy);
        let transcoder = Arc::new(FakeTranscoder::default());
        let catalog = Arc::new(FakeCatalog::default());
        let coordinator = IngestionCoordinator::new(
            chunks.clone(),
            ledger.clone(),
            assembler,
            transcoder.clone(),
            catalog.clone(),
            2,
        );

        Self {
            dir,
            policy,
            coordinator,
            chunks,
            ledger,
            transcoder,
            catalog,
            db,
        }
    }

    pub fn chunk_root(&self) -> PathBuf {
        self.dir.path().join("chunks")
    }

    pub fn video_root(&self) -> PathBuf {
        self.dir.path().join("videos")
    }

    /// A second assembler over the same roots, standing in for a worker
    /// that ran before a restart.
    pub fn assembler(&self) -> Assembler {
        Assembler::new(self.chunks.clone(), self.video_root(), self.policy)
    }

    /// Stage and record a one-chunk upload without dispatching its pipeline,
    /// as if the process stopped right after the completion transition.
    pub async fn complete_without_dispatch(&self, upload_id: &str, file_name: &str, payload: &'static [u8]) {
        self.chunks
            .write(upload_id, 0, bytes::Bytes::from_static(payload))
            .await
            .unwrap();
        let receipt = ChunkReceipt {
            index: 0,
            size_bytes: payload.len() as u64,
            md5: format!("{:x}", md5::compute(payload)),
        };
        let lock = self.ledger.lock(upload_id).await;
        let outcome = self
            .ledger
            .record_chunk(&lock, 0, 1, file_name, "bob", &receipt)
            .await
            .unwrap();
        assert!(outcome.newly_complete);
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.coordinator.clone(), self.db.clone(), 1024 * 1024)
    }
}

pub fn meta(upload_id: &str, index: i64, total_chunks: i64, file_name: &str) -> ChunkMeta {
    ChunkMeta {
        upload_id: upload_id.into(),
        index,
        total_chunks,
        file_name: file_name.into(),
        uploader: "alice".into(),
    }
}
