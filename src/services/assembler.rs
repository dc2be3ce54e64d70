//! src/services/assembler.rs
//!
//! Assembler: concatenates staged chunks, in index order, into one file
//! under the video storage root.
//!
//! The output is built in a scratch file, fsynced, and renamed to a pending
//! file named after the upload. Publishing hard-links the pending file under
//! its final name and reserves the HLS directory derived from that name.
//! The pending file and the chunks stay until [`Assembler::release`], so a
//! retry after a crash finds the earlier publish instead of making a second.

use crate::{
    models::transcode::output_dir_for,
    services::chunk_store::{ChunkStore, ChunkStoreError, ensure_upload_id_safe},
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_FILE_NAME_LEN: usize = 255;
const MAX_DISAMBIGUATION_ATTEMPTS: u32 = 1000;

/// What to do when the final path for an upload is already taken.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Fail the assembly; the chunks stay staged.
    Reject,
    /// Replace the existing file and share its stream directory.
    Overwrite,
    /// Pick `name-1.ext`, `name-2.ext`, ... until both the file name and the
    /// stream directory derived from it are free.
    #[default]
    Disambiguate,
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Chunks(#[from] ChunkStoreError),
    #[error("file name `{0}` is not allowed")]
    InvalidFileName(String),
    #[error("destination `{}` already exists", .0.display())]
    Collision(PathBuf),
    #[error("no free file name for `{0}`")]
    NamesExhausted(String),
    #[error("assembly I/O failed: {0}")]
    Io(#[from] io::Error),
}

pub type AssemblyResult<T> = Result<T, AssemblyError>;

/// Validate a client-supplied display name for use as a single path component.
pub fn ensure_file_name_safe(file_name: &str) -> AssemblyResult<()> {
    let invalid = || AssemblyError::InvalidFileName(file_name.to_string());
    if file_name.is_empty() || file_name.len() > MAX_FILE_NAME_LEN {
        return Err(invalid());
    }
    if file_name == "." || file_name == ".." || file_name.starts_with('.') {
        return Err(invalid());
    }
    if file_name
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
    {
        return Err(invalid());
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Assembler {
    chunks: ChunkStore,
    video_root: PathBuf,
    collision: CollisionPolicy,
}

impl Assembler {
    pub fn new(chunks: ChunkStore, video_root: impl Into<PathBuf>, collision: CollisionPolicy) -> Self {
        Self {
            chunks,
            video_root: video_root.into(),
            collision,
        }
    }

    pub fn video_root(&self) -> &Path {
        &self.video_root
    }

    /// Deterministic destination for `file_name` before collision handling.
    pub fn final_path(&self, file_name: &str) -> PathBuf {
        self.video_root.join(file_name)
    }

    fn pending_path(&self, upload_id: &str) -> PathBuf {
        self.video_root.join(format!(".assemble-{}", upload_id))
    }

    /// Build and publish the assembled file for `upload_id`, returning its path.
    ///
    /// On failure no partial output is left in the video root and the chunks
    /// stay in place, so the same call can simply be repeated. Calling it
    /// again after a success that was never released returns the path
    /// published the first time.
    pub async fn assemble(
        &self,
        upload_id: &str,
        file_name: &str,
        total_chunks: u32,
    ) -> AssemblyResult<PathBuf> {
        ensure_upload_id_safe(upload_id)?;
        ensure_file_name_safe(file_name)?;
        fs::create_dir_all(&self.video_root).await?;
        let pending = self.pending_path(upload_id);

        if fs::try_exists(&pending).await? {
            if let Some(path) = self.find_published(&pending, file_name).await? {
                fs::create_dir_all(output_dir_for(&path)).await?;
                info!(upload_id, "reusing assembled {}", path.display());
                return Ok(path);
            }
        } else {
            self.build(upload_id, total_chunks, &pending).await?;
        }

        match self.publish(&pending, file_name).await {
            Ok(path) => {
                info!(upload_id, "assembled {}", path.display());
                Ok(path)
            }
            Err(err) => {
                let _ = fs::remove_file(&pending).await;
                Err(err)
            }
        }
    }

    /// Drop what assembly kept for a retry: the pending file and the chunks.
    ///
    /// Call only once the published path is durably recorded elsewhere.
    pub async fn release(&self, upload_id: &str) {
        match fs::remove_file(self.pending_path(upload_id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(upload_id, "failed to remove pending assembly: {}", err),
        }
        if let Err(err) = self.chunks.purge(upload_id).await {
            warn!(upload_id, "failed to purge chunks after assembly: {}", err);
        }
    }

    /// Concatenate the chunks into `pending`, which appears only when complete.
    async fn build(&self, upload_id: &str, total_chunks: u32, pending: &Path) -> AssemblyResult<()> {
        let parts = self.chunks.ordered_chunks(upload_id, total_chunks).await?;
        let scratch = self.video_root.join(format!(".scratch-{}", Uuid::new_v4()));

        let written = match concat_into(&scratch, &parts).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&scratch).await;
                return Err(AssemblyError::Io(err));
            }
        };
        if let Err(err) = fs::rename(&scratch, pending).await {
            let _ = fs::remove_file(&scratch).await;
            return Err(AssemblyError::Io(err));
        }

        debug!(upload_id, parts = parts.len(), bytes = written, "built assembled file");
        Ok(())
    }

    /// Link the pending file under its final name according to the collision policy.
    async fn publish(&self, pending: &Path, file_name: &str) -> AssemblyResult<PathBuf> {
        match self.collision {
            CollisionPolicy::Overwrite => {
                let target = self.final_path(file_name);
                let swap = self.video_root.join(format!(".swap-{}", Uuid::new_v4()));
                fs::hard_link(pending, &swap).await?;
                if let Err(err) = fs::rename(&swap, &target).await {
                    let _ = fs::remove_file(&swap).await;
                    return Err(AssemblyError::Io(err));
                }
                fs::create_dir_all(output_dir_for(&target)).await?;
                Ok(target)
            }
            CollisionPolicy::Reject => {
                let target = self.final_path(file_name);
                if claim(pending, &target).await? {
                    Ok(target)
                } else {
                    Err(AssemblyError::Collision(target))
                }
            }
            CollisionPolicy::Disambiguate => {
                for attempt in 0..MAX_DISAMBIGUATION_ATTEMPTS {
                    let candidate = self.candidate(file_name, attempt);
                    if claim(pending, &candidate).await? {
                        return Ok(candidate);
                    }
                    debug!("{} taken, trying next name", candidate.display());
                }
                Err(AssemblyError::NamesExhausted(file_name.to_string()))
            }
        }
    }

    /// A name this policy may have published `pending` under earlier.
    async fn find_published(&self, pending: &Path, file_name: &str) -> io::Result<Option<PathBuf>> {
        let attempts = match self.collision {
            CollisionPolicy::Disambiguate => MAX_DISAMBIGUATION_ATTEMPTS,
            CollisionPolicy::Reject | CollisionPolicy::Overwrite => 1,
        };
        for attempt in 0..attempts {
            let candidate = self.candidate(file_name, attempt);
            if same_file(pending, &candidate).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn candidate(&self, file_name: &str, attempt: u32) -> PathBuf {
        if attempt == 0 {
            self.final_path(file_name)
        } else {
            self.video_root.join(numbered_name(file_name, attempt))
        }
    }
}

/// Publish `pending` at `target` and reserve the stream directory next to it.
///
/// Returns false, leaving nothing behind, when either is already taken. A
/// hard link and `create_dir` both fail atomically on an existing target,
/// which a check-then-rename could not guarantee.
async fn claim(pending: &Path, target: &Path) -> io::Result<bool> {
    match fs::hard_link(pending, target).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err),
    }
    match fs::create_dir(output_dir_for(target)).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(target).await;
            if err.kind() == ErrorKind::AlreadyExists {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(unix)]
async fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let other = match fs::metadata(b).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let this = fs::metadata(a).await?;
    Ok(this.dev() == other.dev() && this.ino() == other.ino())
}

#[cfg(not(unix))]
async fn same_file(_a: &Path, _b: &Path) -> io::Result<bool> {
    Ok(false)
}

/// `clip.mp4` -> `clip-2.mp4`; `clip` -> `clip-2`.
fn numbered_name(file_name: &str, n: u32) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, n, ext),
        _ => format!("{}-{}", file_name, n),
    }
}

async fn concat_into(output: &Path, parts: &[PathBuf]) -> io::Result<u64> {
    let mut out = File::create(output).await?;
    let mut written = 0u64;
    for part in parts {
        let mut input = File::open(part).await?;
        written += tokio::io::copy(&mut input, &mut out).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(written)
}
