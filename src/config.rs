use crate::services::{assembler::CollisionPolicy, transcoder::FfmpegConfig};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub chunk_dir: String,
    pub video_dir: String,
    pub database_url: String,
    pub ffmpeg_path: String,
    pub transcode_timeout_secs: u64,
    pub hls_segment_secs: u32,
    pub collision_policy: CollisionPolicy,
    pub max_chunk_bytes: usize,
    pub max_concurrent_pipelines: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable chunked video ingestion service")]
pub struct Args {
    /// Host to bind to (overrides VIDEO_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides VIDEO_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Staging directory for uploaded chunks (overrides VIDEO_INGEST_CHUNK_DIR)
    #[arg(long)]
    pub chunk_dir: Option<String>,

    /// Directory for assembled and transcoded videos (overrides VIDEO_INGEST_VIDEO_DIR)
    #[arg(long)]
    pub video_dir: Option<String>,

    /// Database URL (overrides VIDEO_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// ffmpeg binary (overrides VIDEO_INGEST_FFMPEG)
    #[arg(long)]
    pub ffmpeg: Option<String>,

    /// Seconds before a transcode is killed (overrides VIDEO_INGEST_TRANSCODE_TIMEOUT_SECS)
    #[arg(long)]
    pub transcode_timeout_secs: Option<u64>,

    /// HLS segment duration in seconds (overrides VIDEO_INGEST_HLS_SEGMENT_SECS)
    #[arg(long)]
    pub hls_segment_secs: Option<u32>,

    /// What to do when an assembled file name is taken (overrides VIDEO_INGEST_COLLISION_POLICY)
    #[arg(long, value_enum)]
    pub collision_policy: Option<CollisionPolicy>,

    /// Largest accepted chunk body in bytes (overrides VIDEO_INGEST_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Assembly/transcode pipelines allowed to run at once (overrides VIDEO_INGEST_MAX_PIPELINES)
    #[arg(long)]
    pub max_pipelines: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("VIDEO_INGEST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("VIDEO_INGEST_PORT", 3000)?;
        let env_chunks =
            env::var("VIDEO_INGEST_CHUNK_DIR").unwrap_or_else(|_| "./data/chunks".into());
        let env_videos =
            env::var("VIDEO_INGEST_VIDEO_DIR").unwrap_or_else(|_| "./data/videos".into());
        let env_db = env::var("VIDEO_INGEST_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/ingest.db".into());
        let env_ffmpeg = env::var("VIDEO_INGEST_FFMPEG").unwrap_or_else(|_| "ffmpeg".into());
        let env_timeout = env_parse("VIDEO_INGEST_TRANSCODE_TIMEOUT_SECS", 3600)?;
        let env_segment = env_parse("VIDEO_INGEST_HLS_SEGMENT_SECS", 10)?;
        let env_collision = match env::var("VIDEO_INGEST_COLLISION_POLICY") {
            Ok(value) => CollisionPolicy::from_str(&value, true).map_err(|err| {
                anyhow::anyhow!("parsing VIDEO_INGEST_COLLISION_POLICY value `{}`: {}", value, err)
            })?,
            Err(_) => CollisionPolicy::default(),
        };
        let env_max_chunk = env_parse("VIDEO_INGEST_MAX_CHUNK_BYTES", 64 * 1024 * 1024)?;
        let env_pipelines = env_parse("VIDEO_INGEST_MAX_PIPELINES", 2)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            chunk_dir: args.chunk_dir.unwrap_or(env_chunks),
            video_dir: args.video_dir.unwrap_or(env_videos),
            database_url: args.database_url.unwrap_or(env_db),
            ffmpeg_path: args.ffmpeg.unwrap_or(env_ffmpeg),
            transcode_timeout_secs: args.transcode_timeout_secs.unwrap_or(env_timeout),
            hls_segment_secs: args.hls_segment_secs.unwrap_or(env_segment),
            collision_policy: args.collision_policy.unwrap_or(env_collision),
            max_chunk_bytes: args.max_chunk_bytes.unwrap_or(env_max_chunk),
            max_concurrent_pipelines: args.max_pipelines.unwrap_or(env_pipelines),
        };

        if cfg.max_concurrent_pipelines == 0 {
            anyhow::bail!("max pipelines must be at least 1");
        }
        if cfg.hls_segment_secs == 0 {
            anyhow::bail!("HLS segment duration must be at least 1 second");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ffmpeg(&self) -> FfmpegConfig {
        FfmpegConfig {
            program: PathBuf::from(&self.ffmpeg_path),
            segment_seconds: self.hls_segment_secs,
            timeout: Duration::from_secs(self.transcode_timeout_secs),
            ..FfmpegConfig::default()
        }
    }
}

/// Read and parse an env var, using `default` only when it is unset.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
