//! src/services/upload_ledger.rs
//!
//! UploadLedger: durable upload progress in SQLite. The ledger, not the
//! staging directory, decides when an upload is complete: each accepted
//! chunk is a row in `upload_chunks`, and the completion transition is a
//! conditional update that can succeed for exactly one caller.

use crate::{
    models::{
        upload::{PublishedUpload, RecordOutcome, UploadSession, UploadStage},
        video::VideoId,
    },
    services::chunk_store::ChunkReceipt,
};
use chrono::Utc;
use sqlx::{Executor, SqlitePool, sqlite::Sqlite};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

const SELECT_SESSION: &str = "SELECT upload_id, file_name, owner, total_chunks, received_count,
        is_complete, stage, failed_stage, last_error, assembled_path, output_dir,
        created_at, updated_at
 FROM upload_sessions WHERE upload_id = ?";

/// Per-key async mutexes. Entries disappear once nobody holds or awaits them,
/// so the map only ever holds uploads with traffic in flight.
#[derive(Clone, Default)]
struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Exclusive hold on one upload's mutations. Obtained from [`UploadLedger::lock`].
pub struct UploadLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyedLocks,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> UploadLock {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        UploadLock {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl UploadLock {
    pub fn upload_id(&self) -> &str {
        &self.key
    }
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        // Release first so the strong count below only sees the map and waiters.
        drop(self.guard.take());
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mutex) = map.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                map.remove(&self.key);
            }
        }
    }
}

/// Durable record of upload progress and pipeline stage.
#[derive(Clone)]
pub struct UploadLedger {
    db: Arc<SqlitePool>,
    locks: KeyedLocks,
}

impl UploadLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            locks: KeyedLocks::default(),
        }
    }

    /// Serialize mutations of one upload. Different uploads never contend.
    ///
    /// The lock is released when the returned guard is dropped.
    pub async fn lock(&self, upload_id: &str) -> UploadLock {
        self.locks.lock(upload_id).await
    }

    /// Record that chunk `index` of the locked upload is persisted.
    ///
    /// Creates the session on first sight using `total_chunks`, `file_name`
    /// and `owner`. Re-recording an index refreshes its receipt and is
    /// otherwise a no-op. Requiring the upload's lock lets callers keep the
    /// chunk write and this record in one critical section.
    ///
    /// `newly_complete` is true only for the call whose chunk moved the
    /// session from receiving to complete.
    pub async fn record_chunk(
        &self,
        lock: &UploadLock,
        index: u32,
        total_chunks: u32,
        file_name: &str,
        owner: &str,
        receipt: &ChunkReceipt,
    ) -> LedgerResult<RecordOutcome> {
        let upload_id = lock.upload_id();
        if total_chunks == 0 || index >= total_chunks {
            return Err(LedgerError::InvalidChunk(format!(
                "chunk index {} out of range for {} chunks",
                index, total_chunks
            )));
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        // Write first so the transaction takes SQLite's write lock up front.
        sqlx::query(
            "INSERT INTO upload_sessions (
                upload_id, file_name, owner, total_chunks, received_count,
                is_complete, stage, created_at, updated_at
             ) VALUES (?, ?, ?, ?, 0, 0, ?, ?, ?)
             ON CONFLICT(upload_id) DO NOTHING",
        )
        .bind(upload_id)
        .bind(file_name)
        .bind(owner)
        .bind(i64::from(total_chunks))
        .bind(UploadStage::Receiving)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let existing = fetch_session(&mut *tx, upload_id).await?;
        if existing.total_chunks != i64::from(total_chunks) {
            return Err(LedgerError::InvalidChunk(format!(
                "upload `{}` declared {} chunks, got {}",
                upload_id, existing.total_chunks, total_chunks
            )));
        }

        if existing.stage != UploadStage::Receiving {
            tx.rollback().await?;
            debug!(upload_id, index, stage = %existing.stage, "chunk after completion ignored");
            let session = self.get(upload_id).await?;
            return Ok(RecordOutcome {
                session,
                newly_complete: false,
                after_completion: true,
            });
        }

        sqlx::query(
            "INSERT INTO upload_chunks (upload_id, chunk_index, size_bytes, md5, received_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(upload_id, chunk_index) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                md5 = excluded.md5,
                received_at = excluded.received_at",
        )
        .bind(upload_id)
        .bind(i64::from(index))
        .bind(receipt.size_bytes as i64)
        .bind(&receipt.md5)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE upload_sessions
             SET received_count = (SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ?),
                 updated_at = ?
             WHERE upload_id = ?",
        )
        .bind(upload_id)
        .bind(now)
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;

        let transition = sqlx::query(
            "UPDATE upload_sessions
             SET is_complete = 1, stage = ?, updated_at = ?
             WHERE upload_id = ? AND is_complete = 0 AND received_count = total_chunks",
        )
        .bind(UploadStage::Complete)
        .bind(now)
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;
        let newly_complete = transition.rows_affected() == 1;

        let mut session = fetch_session(&mut *tx, upload_id).await?;
        session.received_chunks = fetch_indices(&mut *tx, upload_id).await?;
        tx.commit().await?;

        if newly_complete {
            info!(upload_id, total_chunks, "upload complete");
        }

        Ok(RecordOutcome {
            session,
            newly_complete,
            after_completion: false,
        })
    }

    /// Load a session together with its received indices.
    pub async fn get(&self, upload_id: &str) -> LedgerResult<UploadSession> {
        self.find(upload_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(upload_id.to_string()))
    }

    pub async fn find(&self, upload_id: &str) -> LedgerResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(SELECT_SESSION)
            .bind(upload_id)
            .fetch_optional(&*self.db)
            .await?;
        match session {
            Some(mut session) => {
                session.received_chunks = fetch_indices(&*self.db, upload_id).await?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Drop the session and its chunk receipts.
    pub async fn delete(&self, upload_id: &str) -> LedgerResult<()> {
        let mut tx = self.db.begin().await?;
        if delete_session(&mut tx, upload_id).await? == 0 {
            return Err(LedgerError::NotFound(upload_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Retire a registered upload: the session is deleted and a tombstone
    /// naming `video_id` takes its place, in one transaction.
    ///
    /// Only a session in `registering` can be published.
    pub async fn publish(&self, upload_id: &str, video_id: VideoId) -> LedgerResult<()> {
        let mut tx = self.db.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO published_uploads (upload_id, video_id, total_chunks, published_at)
             SELECT upload_id, ?, total_chunks, ?
             FROM upload_sessions WHERE upload_id = ? AND stage = ?
             ON CONFLICT(upload_id) DO NOTHING",
        )
        .bind(video_id)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(UploadStage::Registering)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(LedgerError::NotFound(upload_id.to_string()));
        }
        delete_session(&mut tx, upload_id).await?;
        tx.commit().await?;
        info!(upload_id, %video_id, "upload retired");
        Ok(())
    }

    /// Tombstone of an upload that was already published, if any.
    pub async fn published(&self, upload_id: &str) -> LedgerResult<Option<PublishedUpload>> {
        let published = sqlx::query_as::<_, PublishedUpload>(
            "SELECT upload_id, video_id, total_chunks, published_at
             FROM published_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(published)
    }

    /// Move `upload_id` from `from` to `to`, clearing any recorded failure.
    ///
    /// Returns false when the session is not in `from`; exactly one of several
    /// racing callers can win a given transition.
    pub async fn transition(
        &self,
        upload_id: &str,
        from: UploadStage,
        to: UploadStage,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET stage = ?, failed_stage = NULL, last_error = NULL, updated_at = ?
             WHERE upload_id = ? AND stage = ?",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(from)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Leave a failed pipeline where it broke so a retry can re-enter `stage`.
    pub async fn claim_retry(&self, upload_id: &str, stage: UploadStage) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET stage = ?, failed_stage = NULL, last_error = NULL, updated_at = ?
             WHERE upload_id = ? AND stage = ? AND failed_stage = ?",
        )
        .bind(stage)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(UploadStage::Failed)
        .bind(stage)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Store the assembled file and advance to transcoding.
    pub async fn record_assembled(&self, upload_id: &str, path: &str) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET stage = ?, assembled_path = ?, updated_at = ?
             WHERE upload_id = ? AND stage = ?",
        )
        .bind(UploadStage::Transcoding)
        .bind(path)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(UploadStage::Assembling)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Store the HLS output directory and advance to registration.
    pub async fn record_transcoded(&self, upload_id: &str, output_dir: &str) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET stage = ?, output_dir = ?, updated_at = ?
             WHERE upload_id = ? AND stage = ?",
        )
        .bind(UploadStage::Registering)
        .bind(output_dir)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(UploadStage::Transcoding)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Park the session in `failed`, remembering the stage and reason.
    pub async fn mark_failed(
        &self,
        upload_id: &str,
        stage: UploadStage,
        reason: &str,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET stage = ?, failed_stage = ?, last_error = ?, updated_at = ?
             WHERE upload_id = ? AND stage = ?",
        )
        .bind(UploadStage::Failed)
        .bind(stage)
        .bind(reason)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(stage)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Sessions whose pipeline has not finished: pending assembly or in flight.
    pub async fn list_unfinished(&self) -> LedgerResult<Vec<UploadSession>> {
        let sessions = sqlx::query_as::<_, UploadSession>(
            "SELECT upload_id, file_name, owner, total_chunks, received_count,
                    is_complete, stage, failed_stage, last_error, assembled_path, output_dir,
                    created_at, updated_at
             FROM upload_sessions
             WHERE stage IN ('complete', 'assembling', 'transcoding', 'registering')
             ORDER BY created_at ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(sessions)
    }
}

async fn delete_session(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    upload_id: &str,
) -> Result<u64, sqlx::Error> {
    sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
        .bind(upload_id)
        .execute(&mut **tx)
        .await?;
    let result = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
        .bind(upload_id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

async fn fetch_session<'e, E>(executor: E, upload_id: &str) -> Result<UploadSession, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, UploadSession>(SELECT_SESSION)
        .bind(upload_id)
        .fetch_one(executor)
        .await
}

async fn fetch_indices<'e, E>(
    executor: E,
    upload_id: &str,
) -> Result<std::collections::BTreeSet<u32>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<i64> = sqlx::query_scalar(
        "SELECT chunk_index FROM upload_chunks WHERE upload_id = ? ORDER BY chunk_index",
    )
    .bind(upload_id)
    .fetch_all(executor)
    .await?;
    Ok(rows
        .into_iter()
        .filter_map(|idx| u32::try_from(idx).ok())
        .collect())
}
