//! Defines routes for chunk ingestion.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Uploads**
//!   - `POST /uploads/chunk`: multipart chunk upload
//!   - `PUT  /uploads/{upload_id}/chunks/{index}`: raw-body chunk upload
//!   - `GET  /uploads/{upload_id}`: progress and stage
//!   - `POST /uploads/{upload_id}/retry`: restart a failed stage

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{get_upload, put_chunk, retry_upload, upload_chunk},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. `max_chunk_bytes` caps request bodies; multipart
/// overhead is allowed on top of it.
pub fn routes(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload routes
        .route("/uploads/chunk", post(upload_chunk))
        .route("/uploads/{upload_id}", get(get_upload))
        .route("/uploads/{upload_id}/retry", post(retry_upload))
        .route("/uploads/{upload_id}/chunks/{index}", put(put_chunk))
        .layer(DefaultBodyLimit::max(max_chunk_bytes.saturating_add(64 * 1024)))
}
