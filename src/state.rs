//! Shared state handed to every handler.

use crate::services::coordinator::IngestionCoordinator;
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: IngestionCoordinator,

    /// Pool behind the ledger and catalog, used directly by readiness checks.
    pub db: Arc<SqlitePool>,

    /// Largest chunk body accepted on any upload route.
    pub max_chunk_bytes: usize,
}

impl AppState {
    pub fn new(coordinator: IngestionCoordinator, db: Arc<SqlitePool>, max_chunk_bytes: usize) -> Self {
        Self {
            coordinator,
            db,
            max_chunk_bytes,
        }
    }
}
