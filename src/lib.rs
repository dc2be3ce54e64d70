//! Resumable chunked video ingestion.
//!
//! Chunks are staged on disk, progress is tracked in SQLite, and the upload
//! that receives its last chunk is assembled, transcoded to HLS and
//! registered in the catalog exactly once.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use crate::{
    services::{
        assembler::Assembler,
        catalog::SqliteCatalog,
        chunk_store::ChunkStore,
        coordinator::IngestionCoordinator,
        transcoder::FfmpegTranscoder,
        upload_ledger::UploadLedger,
    },
    state::AppState,
};
use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Wire the production components together from configuration.
pub fn build_state(cfg: &config::AppConfig, db: Arc<SqlitePool>) -> AppState {
    let chunks = ChunkStore::new(&cfg.chunk_dir);
    let ledger = UploadLedger::new(db.clone());
    let assembler = Assembler::new(chunks.clone(), &cfg.video_dir, cfg.collision_policy);
    let transcoder = Arc::new(FfmpegTranscoder::new(cfg.ffmpeg()));
    let catalog = Arc::new(SqliteCatalog::new(db.clone()));

    let coordinator = IngestionCoordinator::new(
        chunks,
        ledger,
        assembler,
        transcoder,
        catalog,
        cfg.max_concurrent_pipelines,
    );
    AppState::new(coordinator, db, cfg.max_chunk_bytes)
}

/// Router with state attached, ready to serve.
pub fn app(state: AppState) -> Router {
    let limit = state.max_chunk_bytes;
    routes::routes::routes(limit).with_state(state)
}
