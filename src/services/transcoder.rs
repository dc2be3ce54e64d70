//! src/services/transcoder.rs
//!
//! Transcoder capability and its ffmpeg/HLS implementation. The coordinator
//! only sees the [`Transcoder`] trait, so the external binary can be swapped
//! for a library or a remote service.

use crate::models::transcode::{TranscodeJob, TranscodeStatus};
use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tracing::{debug, info, warn};

/// Longest stderr tail kept in a [`TranscodeError::Failed`].
const STDERR_EXCERPT_BYTES: usize = 4 * 1024;

/// Cap on captured output per stream; the rest is discarded.
const MAX_CAPTURE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("input `{}` does not exist", .0.display())]
    InputMissing(PathBuf),
    #[error("could not start transcoder: {0}")]
    Spawn(#[source] io::Error),
    #[error("transcoder exited with {exit_code:?}: {stderr_excerpt}")]
    Failed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },
    #[error("transcoder killed after {0:?}")]
    TimedOut(Duration),
    #[error("transcoder succeeded but wrote no manifest at `{}`", .0.display())]
    MissingManifest(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Converts an assembled container file into segmented streaming output.
///
/// Re-running on the same input must be safe and overwrite earlier output.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Returns the directory holding the manifest and segments.
    async fn transcode(&self, input: &Path) -> Result<PathBuf, TranscodeError>;
}

#[derive(Clone, Debug)]
pub struct FfmpegConfig {
    /// Binary to run; resolved through `PATH` when not absolute.
    pub program: PathBuf,
    /// Options placed before the generated arguments (e.g. `-hide_banner`).
    pub global_args: Vec<String>,
    pub segment_seconds: u32,
    pub timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            global_args: vec!["-hide_banner".into(), "-loglevel".into(), "error".into()],
            segment_seconds: 10,
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Runs ffmpeg to produce an HLS playlist (`index.m3u8`) plus numbered segments.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    cfg: FfmpegConfig,
}

impl FfmpegTranscoder {
    pub fn new(cfg: FfmpegConfig) -> Self {
        Self { cfg }
    }

    fn build_command(&self, job: &TranscodeJob) -> Command {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.global_args)
            .arg("-y")
            .arg("-i")
            .arg(&job.input_path)
            .args([
                "-profile:v",
                "baseline",
                "-level",
                "3.0",
                "-start_number",
                "0",
                "-hls_time",
            ])
            .arg(self.cfg.segment_seconds.to_string())
            .args(["-hls_list_size", "0", "-f", "hls"])
            .arg(job.manifest_path());
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path) -> Result<PathBuf, TranscodeError> {
        if !fs::try_exists(input).await? {
            return Err(TranscodeError::InputMissing(input.to_path_buf()));
        }

        let mut job = TranscodeJob::for_input(input);
        fs::create_dir_all(&job.output_dir).await?;

        let mut cmd = self.build_command(&job);
        // A child dropped on timeout is killed rather than leaked.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(TranscodeError::Spawn)?;
        job.status = TranscodeStatus::Running;
        debug!(input = %input.display(), "transcoder started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move { read_capped(stdout).await });
        let stderr_task = tokio::spawn(async move { read_capped(stderr).await });

        let status = match tokio::time::timeout(self.cfg.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_elapsed) => {
                let _ = child.kill().await;
                warn!(input = %input.display(), "transcoder timed out after {:?}", self.cfg.timeout);
                return Err(TranscodeError::TimedOut(self.cfg.timeout));
            }
        };

        let _ = stdout_task.await;
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        if !status.success() {
            job.status = TranscodeStatus::Failed;
            return Err(TranscodeError::Failed {
                exit_code: status.code(),
                stderr_excerpt: excerpt(&stderr_bytes),
            });
        }

        let manifest = job.manifest_path();
        if !fs::try_exists(&manifest).await? {
            job.status = TranscodeStatus::Failed;
            return Err(TranscodeError::MissingManifest(manifest));
        }

        job.status = TranscodeStatus::Succeeded;
        info!(
            input = %input.display(),
            output = %job.output_dir.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "transcode finished"
        );
        Ok(job.output_dir)
    }
}

async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_CAPTURE_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

/// Last [`STDERR_EXCERPT_BYTES`] of stderr; ffmpeg puts the actual error at the end.
fn excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_EXCERPT_BYTES {
        return trimmed.to_string();
    }
    let mut cut = trimmed.len() - STDERR_EXCERPT_BYTES;
    while !trimmed.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &trimmed[cut..])
}
