//! src/services/coordinator.rs
//!
//! IngestionCoordinator: accepts chunks, records them, and when the ledger
//! reports the completion transition, runs assemble -> transcode -> register
//! on a background task. The transition is the only guard against running
//! the pipeline twice; retries re-claim a failed stage through the same kind
//! of conditional ledger update.

use crate::{
    models::{
        upload::{UploadSession, UploadStage},
        video::VideoId,
    },
    services::{
        assembler::{Assembler, ensure_file_name_safe},
        catalog::{Catalog, NewVideo},
        chunk_store::{ChunkReceipt, ChunkStore, ChunkStoreError, ensure_upload_id_safe},
        transcoder::Transcoder,
        upload_ledger::{LedgerError, UploadLedger},
    },
};
use bytes::Bytes;
use futures::{Stream, stream};
use serde::Serialize;
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("could not store chunk: {0}")]
    StorageWrite(#[source] ChunkStoreError),
    #[error("chunk too large: {0}")]
    ChunkTooLarge(String),
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{upload_id}` cannot be retried while {stage}")]
    NotRetryable {
        upload_id: String,
        stage: UploadStage,
    },
    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for IngestError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => IngestError::NotFound(id),
            LedgerError::InvalidChunk(reason) => IngestError::InvalidChunk(reason),
            other => IngestError::Ledger(other),
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// One incoming chunk, as reported by the transport.
///
/// Numbers arrive unvalidated; `index` is 0-based.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub upload_id: String,
    pub index: i64,
    pub total_chunks: i64,
    pub file_name: String,
    pub uploader: String,
}

/// Acknowledgement returned to the client that sent a chunk.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptResult {
    pub upload_id: String,
    pub chunk_index: u32,
    pub received_chunks: i64,
    pub total_chunks: i64,
    pub complete: bool,
    /// Chunk arrived after completion; it was acknowledged but not stored.
    pub ignored: bool,
    pub receipt: Option<ChunkReceipt>,
}

/// What [`IngestionCoordinator::resume_interrupted`] did at startup.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ResumeReport {
    pub dispatched: Vec<String>,
    pub parked: Vec<String>,
}

/// A pipeline stage that did not finish.
#[derive(Debug)]
struct StageFailure {
    stage: UploadStage,
    reason: String,
}

impl StageFailure {
    fn new(stage: UploadStage, err: impl fmt::Display) -> Self {
        Self {
            stage,
            reason: err.to_string(),
        }
    }
}

/// Tag an error with the pipeline stage it happened in.
trait AtStage<T> {
    fn at(self, stage: UploadStage) -> Result<T, StageFailure>;
}

impl<T, E: fmt::Display> AtStage<T> for Result<T, E> {
    fn at(self, stage: UploadStage) -> Result<T, StageFailure> {
        self.map_err(|err| StageFailure::new(stage, err))
    }
}

/// Orchestrates chunk acceptance and the post-completion pipeline.
#[derive(Clone)]
pub struct IngestionCoordinator {
    chunks: ChunkStore,
    ledger: UploadLedger,
    assembler: Assembler,
    transcoder: Arc<dyn Transcoder>,
    catalog: Arc<dyn Catalog>,
    tasks: TaskTracker,
    permits: Arc<Semaphore>,
}

impl IngestionCoordinator {
    pub fn new(
        chunks: ChunkStore,
        ledger: UploadLedger,
        assembler: Assembler,
        transcoder: Arc<dyn Transcoder>,
        catalog: Arc<dyn Catalog>,
        max_concurrent_pipelines: usize,
    ) -> Self {
        Self {
            chunks,
            ledger,
            assembler,
            transcoder,
            catalog,
            tasks: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_pipelines.max(1))),
        }
    }

    pub fn chunk_root(&self) -> &Path {
        self.chunks.base_path()
    }

    pub fn video_root(&self) -> &Path {
        self.assembler.video_root()
    }

    /// Accept a chunk whose payload is already in memory.
    pub async fn accept_chunk(&self, meta: ChunkMeta, payload: Bytes) -> IngestResult<AcceptResult> {
        self.accept_chunk_stream(meta, stream::once(async move { Ok(payload) }))
            .await
    }

    /// Validate, persist and record one chunk.
    ///
    /// Invalid input is rejected before anything is written. The call that
    /// completes the upload dispatches the pipeline and returns without
    /// waiting for it; pipeline failures are recorded on the session.
    pub async fn accept_chunk_stream<S>(
        &self,
        meta: ChunkMeta,
        payload: S,
    ) -> IngestResult<AcceptResult>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let (index, total) = validate(&meta)?;

        // Cheap early answer; repeated under the upload lock below.
        if let Some(done) = self.settled(&meta, index, total).await? {
            return Ok(done);
        }

        let staged = self
            .chunks
            .stage_stream(&meta.upload_id, index, payload)
            .await
            .map_err(storage_error)?;

        // Only a receiving upload takes new chunk data. The stage leaves
        // `receiving` inside `record_chunk`, under this same lock, so once the
        // check passes nothing reads or purges the staging directory until
        // the chunk is both in place and recorded.
        let lock = self.ledger.lock(&meta.upload_id).await;
        if let Some(done) = self.settled(&meta, index, total).await? {
            staged.discard().await;
            return Ok(done);
        }
        let receipt = self.chunks.commit(staged).await.map_err(storage_error)?;
        let outcome = self
            .ledger
            .record_chunk(&lock, index, total, &meta.file_name, &meta.uploader, &receipt)
            .await?;
        drop(lock);

        if outcome.newly_complete {
            if self
                .ledger
                .transition(&meta.upload_id, UploadStage::Complete, UploadStage::Assembling)
                .await?
            {
                self.dispatch(meta.upload_id.clone(), UploadStage::Assembling);
            } else {
                warn!(upload_id = %meta.upload_id, "completed upload was claimed elsewhere");
            }
        }

        let session = &outcome.session;
        Ok(AcceptResult {
            upload_id: meta.upload_id,
            chunk_index: index,
            received_chunks: session.received_count,
            total_chunks: session.total_chunks,
            complete: session.is_complete,
            ignored: outcome.after_completion,
            receipt: Some(receipt),
        })
    }

    /// Acknowledgement for a chunk that must not be written, if this is one.
    ///
    /// Chunks for an upload past `receiving`, or already published, are
    /// acknowledged as duplicates. A total that disagrees with the one the
    /// upload was opened with is rejected.
    async fn settled(
        &self,
        meta: &ChunkMeta,
        index: u32,
        total: u32,
    ) -> IngestResult<Option<AcceptResult>> {
        let (declared, received, complete) = match self.ledger.find(&meta.upload_id).await? {
            Some(session) if session.stage == UploadStage::Receiving => {
                check_total(meta, session.total_chunks, total)?;
                return Ok(None);
            }
            Some(session) => (session.total_chunks, session.received_count, session.is_complete),
            None => match self.ledger.published(&meta.upload_id).await? {
                Some(published) => (published.total_chunks, published.total_chunks, true),
                None => return Ok(None),
            },
        };
        check_total(meta, declared, total)?;
        debug!(upload_id = %meta.upload_id, index, "chunk for completed upload acknowledged");
        Ok(Some(AcceptResult {
            upload_id: meta.upload_id.clone(),
            chunk_index: index,
            received_chunks: received,
            total_chunks: declared,
            complete,
            ignored: true,
            receipt: None,
        }))
    }

    /// Current ledger state of an upload that has not been published yet.
    pub async fn status(&self, upload_id: &str) -> IngestResult<UploadSession> {
        Ok(self.ledger.get(upload_id).await?)
    }

    /// Re-enter the pipeline for a failed or stalled upload.
    ///
    /// A failed upload resumes at the stage that failed, reusing whatever the
    /// earlier stages produced: stored chunks or an already published file
    /// for assembly, the retained assembled file for transcoding, an existing
    /// catalog record for registration. Returns the stage that was restarted.
    pub async fn retry(&self, upload_id: &str) -> IngestResult<UploadStage> {
        let session = self.ledger.get(upload_id).await?;
        let not_retryable = || IngestError::NotRetryable {
            upload_id: upload_id.to_string(),
            stage: session.stage,
        };

        let stage = match (session.stage, session.failed_stage) {
            (UploadStage::Failed, Some(stage)) => {
                if !self.ledger.claim_retry(upload_id, stage).await? {
                    return Err(not_retryable());
                }
                stage
            }
            (UploadStage::Complete, _) => {
                if !self
                    .ledger
                    .transition(upload_id, UploadStage::Complete, UploadStage::Assembling)
                    .await?
                {
                    return Err(not_retryable());
                }
                UploadStage::Assembling
            }
            _ => return Err(not_retryable()),
        };

        info!(upload_id, %stage, "retrying upload pipeline");
        self.dispatch(upload_id.to_string(), stage);
        Ok(stage)
    }

    /// Reconcile the ledger after a restart. Call before accepting traffic.
    ///
    /// Uploads that completed but never started assembling are dispatched.
    /// Uploads caught mid-pipeline are parked as failed at that stage and
    /// wait for an explicit [`retry`](Self::retry).
    pub async fn resume_interrupted(&self) -> IngestResult<ResumeReport> {
        let mut report = ResumeReport::default();
        for session in self.ledger.list_unfinished().await? {
            let upload_id = session.upload_id;
            if session.stage == UploadStage::Complete {
                if self
                    .ledger
                    .transition(&upload_id, UploadStage::Complete, UploadStage::Assembling)
                    .await?
                {
                    self.dispatch(upload_id.clone(), UploadStage::Assembling);
                    report.dispatched.push(upload_id);
                }
            } else if session.stage.is_pipeline_stage() {
                self.ledger
                    .mark_failed(&upload_id, session.stage, "interrupted by restart")
                    .await?;
                warn!(upload_id = %upload_id, stage = %session.stage, "pipeline interrupted by restart");
                report.parked.push(upload_id);
            }
        }
        Ok(report)
    }

    /// Wait until every dispatched pipeline has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn dispatch(&self, upload_id: String, stage: UploadStage) {
        let this = self.clone();
        self.tasks.spawn(async move {
            this.run_pipeline(upload_id, stage).await;
        });
    }

    async fn run_pipeline(&self, upload_id: String, stage: UploadStage) {
        let _permit = self.permits.clone().acquire_owned().await.ok();
        match self.drive(&upload_id, stage).await {
            Ok(video_id) => info!(upload_id = %upload_id, %video_id, "upload published"),
            Err(failure) => {
                error!(
                    upload_id = %upload_id,
                    stage = %failure.stage,
                    "ingestion pipeline failed: {}",
                    failure.reason
                );
                if let Err(err) = self
                    .ledger
                    .mark_failed(&upload_id, failure.stage, &failure.reason)
                    .await
                {
                    error!(upload_id = %upload_id, "could not record pipeline failure: {}", err);
                }
            }
        }
    }

    /// Run the pipeline from `start` to publication.
    ///
    /// Every stage tolerates having run before: assembly finds its earlier
    /// publish, transcoding overwrites its output, registration is keyed on
    /// the upload id.
    async fn drive(&self, upload_id: &str, start: UploadStage) -> Result<VideoId, StageFailure> {
        let session = self.ledger.get(upload_id).await.at(start)?;
        let mut assembled = session.assembled_path.clone().map(PathBuf::from);
        let mut stream_dir = session.output_dir.clone().map(PathBuf::from);

        if start == UploadStage::Assembling {
            let stage = UploadStage::Assembling;
            let total = u32::try_from(session.total_chunks).at(stage)?;
            let path = self
                .assembler
                .assemble(upload_id, &session.file_name, total)
                .await
                .at(stage)?;
            if !self
                .ledger
                .record_assembled(upload_id, &path.to_string_lossy())
                .await
                .at(stage)?
            {
                return Err(StageFailure::new(stage, "stage changed while assembling"));
            }
            self.assembler.release(upload_id).await;
            assembled = Some(path);
        }

        if matches!(start, UploadStage::Assembling | UploadStage::Transcoding) {
            let stage = UploadStage::Transcoding;
            let input = assembled
                .clone()
                .ok_or_else(|| StageFailure::new(stage, "no assembled file recorded"))?;
            let out = self.transcoder.transcode(&input).await.at(stage)?;
            if !self
                .ledger
                .record_transcoded(upload_id, &out.to_string_lossy())
                .await
                .at(stage)?
            {
                return Err(StageFailure::new(stage, "stage changed while transcoding"));
            }
            stream_dir = Some(out);
        }

        let stage = UploadStage::Registering;
        let file_path =
            assembled.ok_or_else(|| StageFailure::new(stage, "no assembled file recorded"))?;
        let video_id = self
            .catalog
            .create_video_record(NewVideo {
                upload_id,
                owner: &session.owner,
                file_path: &file_path,
                display_name: &session.file_name,
                stream_dir: stream_dir.as_deref(),
            })
            .await
            .at(stage)?;

        if let Err(err) = self.ledger.publish(upload_id, video_id).await {
            // Registration is keyed on the upload id, so re-running it later is harmless.
            error!(upload_id, %video_id, "registered but could not retire session: {}", err);
        }
        Ok(video_id)
    }
}

/// Check numbers and names before anything is written.
fn validate(meta: &ChunkMeta) -> IngestResult<(u32, u32)> {
    if meta.total_chunks <= 0 {
        return Err(IngestError::InvalidChunk(format!(
            "total_chunks must be positive, got {}",
            meta.total_chunks
        )));
    }
    if meta.index < 0 || meta.index >= meta.total_chunks {
        return Err(IngestError::InvalidChunk(format!(
            "chunk index {} out of range for {} chunks",
            meta.index, meta.total_chunks
        )));
    }
    let total = u32::try_from(meta.total_chunks)
        .map_err(|_| IngestError::InvalidChunk("total_chunks too large".into()))?;
    let index = u32::try_from(meta.index)
        .map_err(|_| IngestError::InvalidChunk("chunk index too large".into()))?;
    ensure_upload_id_safe(&meta.upload_id).map_err(|e| IngestError::InvalidChunk(e.to_string()))?;
    ensure_file_name_safe(&meta.file_name).map_err(|e| IngestError::InvalidChunk(e.to_string()))?;
    Ok((index, total))
}

fn check_total(meta: &ChunkMeta, declared: i64, total: u32) -> IngestResult<()> {
    if declared != i64::from(total) {
        return Err(IngestError::InvalidChunk(format!(
            "upload `{}` declared {} chunks, got {}",
            meta.upload_id, declared, total
        )));
    }
    Ok(())
}

/// Payloads over the transport's size cap arrive as `FileTooLarge` reads.
fn storage_error(err: ChunkStoreError) -> IngestError {
    match err {
        ChunkStoreError::Io(io_err) if io_err.kind() == io::ErrorKind::FileTooLarge => {
            IngestError::ChunkTooLarge(io_err.to_string())
        }
        other => IngestError::StorageWrite(other),
    }
}
