//! Core data models for the chunked video ingestion service.
//!
//! Upload sessions and catalog entries map to SQLite tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod transcode;
pub mod upload;
pub mod video;
