//! src/services/chunk_store.rs
//!
//! ChunkStore: raw chunk payloads on local disk, staged beneath
//! `base_path/{upload_id}/{index}.part` until the assembler consumes them.
//! Every write lands in a temp file first and is renamed into place, so a
//! reader never observes a half-written chunk.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use serde::Serialize;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_UPLOAD_ID_LEN: usize = 128;

/// Temp files for chunks in flight. Upload ids cannot start with a dot.
const INCOMING_DIR: &str = ".incoming";

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("upload id `{0}` is not a valid staging key")]
    InvalidUploadId(String),
    #[error("upload `{upload_id}` is missing chunks {missing:?}")]
    IncompleteUpload { upload_id: String, missing: Vec<u32> },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ChunkStoreResult<T> = Result<T, ChunkStoreError>;

/// Acknowledgement for one persisted chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkReceipt {
    pub index: u32,
    pub size_bytes: u64,
    /// Hex MD5 of the payload, echoed so clients can verify the transfer.
    pub md5: String,
}

/// A fully written chunk payload that is not yet part of its upload.
///
/// Dropping it without [`ChunkStore::commit`] or [`StagedChunk::discard`]
/// removes the temp file.
#[derive(Debug)]
pub struct StagedChunk {
    upload_id: String,
    tmp_path: Option<PathBuf>,
    receipt: ChunkReceipt,
}

impl StagedChunk {
    pub fn receipt(&self) -> &ChunkReceipt {
        &self.receipt
    }

    /// Throw the payload away.
    pub async fn discard(mut self) {
        if let Some(path) = self.tmp_path.take() {
            if let Err(err) = fs::remove_file(&path).await {
                warn!("could not remove staged chunk {}: {}", path.display(), err);
            }
        }
    }
}

impl Drop for StagedChunk {
    fn drop(&mut self) {
        if let Some(path) = self.tmp_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Staging area for chunk payloads.
///
/// Only this type writes into the staging root; the assembler reads through
/// [`ChunkStore::ordered_chunks`] and releases the area with [`ChunkStore::purge`].
#[derive(Clone, Debug)]
pub struct ChunkStore {
    base_path: PathBuf,
}

/// Reject upload ids that would escape or pollute the staging root.
///
/// Allowed: 1–128 ASCII alphanumerics, `-`, `_`, `.`; no leading dot.
pub fn ensure_upload_id_safe(upload_id: &str) -> ChunkStoreResult<()> {
    let invalid = || ChunkStoreError::InvalidUploadId(upload_id.to_string());
    if upload_id.is_empty() || upload_id.len() > MAX_UPLOAD_ID_LEN {
        return Err(invalid());
    }
    if upload_id.starts_with('.') {
        return Err(invalid());
    }
    if !upload_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(invalid());
    }
    Ok(())
}

impl ChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding every chunk of one upload.
    fn staging_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(upload_id)
    }

    fn chunk_path(&self, upload_id: &str, index: u32) -> PathBuf {
        self.staging_dir(upload_id).join(format!("{}.part", index))
    }

    /// Persist a chunk from an in-memory payload.
    pub async fn write(
        &self,
        upload_id: &str,
        index: u32,
        payload: Bytes,
    ) -> ChunkStoreResult<ChunkReceipt> {
        self.write_stream(upload_id, index, stream::once(async move { Ok(payload) }))
            .await
    }

    /// Stream a chunk payload to disk, replacing any earlier payload at the same index.
    ///
    /// Shorthand for [`stage_stream`](Self::stage_stream) followed by
    /// [`commit`](Self::commit) with no check in between.
    pub async fn write_stream<S>(
        &self,
        upload_id: &str,
        index: u32,
        stream: S,
    ) -> ChunkStoreResult<ChunkReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let staged = self.stage_stream(upload_id, index, stream).await?;
        self.commit(staged).await
    }

    /// Drain a chunk payload into a temp file under the incoming area.
    ///
    /// - Writes bytes incrementally to a uniquely named temp file.
    /// - Computes MD5 and size while streaming.
    /// - fsyncs before returning.
    ///
    /// Nothing is visible in the upload's staging directory until the
    /// returned [`StagedChunk`] is committed. Temp files live outside the
    /// per-upload directories so a purge never races an in-flight write.
    pub async fn stage_stream<S>(
        &self,
        upload_id: &str,
        index: u32,
        stream: S,
    ) -> ChunkStoreResult<StagedChunk>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        ensure_upload_id_safe(upload_id)?;
        let incoming = self.base_path.join(INCOMING_DIR);
        fs::create_dir_all(&incoming).await?;
        let tmp_path = incoming.join(format!("{}-{}-{}.tmp", upload_id, index, Uuid::new_v4()));

        match write_to_temp(&tmp_path, stream).await {
            Ok((size_bytes, md5)) => Ok(StagedChunk {
                upload_id: upload_id.to_string(),
                tmp_path: Some(tmp_path),
                receipt: ChunkReceipt {
                    index,
                    size_bytes,
                    md5,
                },
            }),
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(ChunkStoreError::Io(err))
            }
        }
    }

    /// Rename a staged payload over `{index}.part`.
    ///
    /// Concurrent commits of the same index each rename their own temp file;
    /// the last rename wins and the loser's bytes are never visible.
    pub async fn commit(&self, mut staged: StagedChunk) -> ChunkStoreResult<ChunkReceipt> {
        let Some(tmp_path) = staged.tmp_path.take() else {
            return Err(ChunkStoreError::Io(io::Error::other("staged chunk already consumed")));
        };
        let upload_id = staged.upload_id.as_str();
        let index = staged.receipt.index;

        let result = async {
            fs::create_dir_all(self.staging_dir(upload_id)).await?;
            let final_path = self.chunk_path(upload_id, index);
            match fs::rename(&tmp_path, &final_path).await {
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    fs::remove_file(&final_path).await?;
                    fs::rename(&tmp_path, &final_path).await
                }
                other => other,
            }
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ChunkStoreError::Io(err));
        }

        debug!(upload_id, index, size_bytes = staged.receipt.size_bytes, "stored chunk");
        Ok(staged.receipt.clone())
    }

    /// Paths of chunks `0..total_chunks` in index order.
    ///
    /// Fails with `IncompleteUpload` listing every missing index instead of
    /// handing back a gapped sequence.
    pub async fn ordered_chunks(
        &self,
        upload_id: &str,
        total_chunks: u32,
    ) -> ChunkStoreResult<Vec<PathBuf>> {
        ensure_upload_id_safe(upload_id)?;
        let mut paths = Vec::with_capacity(total_chunks as usize);
        let mut missing = Vec::new();
        for index in 0..total_chunks {
            let path = self.chunk_path(upload_id, index);
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => paths.push(path),
                Ok(_) => missing.push(index),
                Err(err) if err.kind() == ErrorKind::NotFound => missing.push(index),
                Err(err) => return Err(ChunkStoreError::Io(err)),
            }
        }
        if !missing.is_empty() {
            return Err(ChunkStoreError::IncompleteUpload {
                upload_id: upload_id.to_string(),
                missing,
            });
        }
        Ok(paths)
    }

    /// Remove every chunk and the staging directory of an upload.
    ///
    /// Already-missing files or directories are not an error.
    pub async fn purge(&self, upload_id: &str) -> ChunkStoreResult<()> {
        ensure_upload_id_safe(upload_id)?;
        let dir = self.staging_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => {
                debug!(upload_id, "purged chunk staging dir {}", dir.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ChunkStoreError::Io(err)),
        }
    }
}

/// Drain `stream` into a fresh file at `tmp_path`, returning size and MD5.
async fn write_to_temp<S>(tmp_path: &Path, stream: S) -> io::Result<(u64, String)>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut file = File::create(tmp_path).await?;
    let mut size_bytes: u64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as u64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size_bytes, format!("{:x}", digest.compute())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn resend_replaces_previous_payload() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());

        store.write("u1", 0, Bytes::from_static(b"X")).await.unwrap();
        let receipt = store.write("u1", 0, Bytes::from_static(b"YY")).await.unwrap();
        assert_eq!(receipt.size_bytes, 2);
        assert_eq!(receipt.md5, format!("{:x}", md5::compute(b"YY")));

        let paths = store.ordered_chunks("u1", 1).await.unwrap();
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"YY");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("u1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(leftovers, vec!["0.part".to_string()]);
    }

    #[tokio::test]
    async fn ordered_chunks_reports_every_gap() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        store.write("u2", 1, Bytes::from_static(b"a")).await.unwrap();
        store.write("u2", 3, Bytes::from_static(b"b")).await.unwrap();

        match store.ordered_chunks("u2", 4).await {
            Err(ChunkStoreError::IncompleteUpload { upload_id, missing }) => {
                assert_eq!(upload_id, "u2");
                assert_eq!(missing, vec![0, 2]);
            }
            other => panic!("expected IncompleteUpload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ordered_chunks_follow_index_not_arrival() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        for index in [2u32, 0, 1] {
            store
                .write("u3", index, Bytes::from(index.to_string()))
                .await
                .unwrap();
        }
        let paths = store.ordered_chunks("u3", 3).await.unwrap();
        let contents: Vec<String> = paths
            .iter()
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect();
        assert_eq!(contents, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn purge_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        store.write("u4", 0, Bytes::from_static(b"z")).await.unwrap();

        store.purge("u4").await.unwrap();
        assert!(!dir.path().join("u4").exists());
        store.purge("u4").await.unwrap();
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_chunk_behind() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]);

        let err = store.write_stream("u5", 0, body).await.unwrap_err();
        assert!(matches!(err, ChunkStoreError::Io(_)));
        assert!(!dir.path().join("u5").exists());
        let incoming = std::fs::read_dir(dir.path().join(INCOMING_DIR)).unwrap().count();
        assert_eq!(incoming, 0);
    }

    #[tokio::test]
    async fn staged_chunk_is_invisible_until_committed() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());

        let staged = store
            .stage_stream("u6", 0, stream::once(async { Ok(Bytes::from_static(b"late")) }))
            .await
            .unwrap();
        assert_eq!(staged.receipt().size_bytes, 4);
        assert!(!dir.path().join("u6").exists());

        // A purge in between does not touch payloads still in flight.
        store.purge("u6").await.unwrap();
        let receipt = store.commit(staged).await.unwrap();
        assert_eq!(receipt.index, 0);
        assert_eq!(std::fs::read(dir.path().join("u6").join("0.part")).unwrap(), b"late");
    }

    #[tokio::test]
    async fn discarded_or_dropped_chunks_leave_nothing() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());

        let discarded = store.stage_stream("u7", 0, stream::once(async { Ok(Bytes::from_static(b"a")) }));
        discarded.await.unwrap().discard().await;
        let dropped = store
            .stage_stream("u7", 1, stream::once(async { Ok(Bytes::from_static(b"b")) }))
            .await
            .unwrap();
        drop(dropped);

        assert!(!dir.path().join("u7").exists());
        let incoming = std::fs::read_dir(dir.path().join(INCOMING_DIR)).unwrap().count();
        assert_eq!(incoming, 0);
    }

    #[test]
    fn upload_id_rules() {
        assert!(ensure_upload_id_safe("u1").is_ok());
        assert!(ensure_upload_id_safe("a-b_c.9").is_ok());
        assert!(ensure_upload_id_safe("").is_err());
        assert!(ensure_upload_id_safe(".hidden").is_err());
        assert!(ensure_upload_id_safe("../etc").is_err());
        assert!(ensure_upload_id_safe("a/b").is_err());
        assert!(ensure_upload_id_safe(&"x".repeat(129)).is_err());
    }
}
