//! Ingestion components, leaves first: chunk staging, the upload ledger,
//! assembly, transcoding and catalog registration, tied together by the
//! coordinator.

pub mod assembler;
pub mod catalog;
pub mod chunk_store;
pub mod coordinator;
pub mod transcoder;
pub mod upload_ledger;
