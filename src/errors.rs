use crate::services::coordinator::IngestError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let status = match &err {
            IngestError::InvalidChunk(_) => StatusCode::BAD_REQUEST,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::NotRetryable { .. } => StatusCode::CONFLICT,
            IngestError::ChunkTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            // Retryable: the client resends the chunk.
            IngestError::StorageWrite(_) => StatusCode::SERVICE_UNAVAILABLE,
            IngestError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
        }
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_errors_map_to_statuses() {
        let cases = [
            (IngestError::InvalidChunk("x".into()), StatusCode::BAD_REQUEST),
            (IngestError::NotFound("u".into()), StatusCode::NOT_FOUND),
            (
                IngestError::ChunkTooLarge("over 4 bytes".into()),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                IngestError::NotRetryable {
                    upload_id: "u".into(),
                    stage: crate::models::upload::UploadStage::Receiving,
                },
                StatusCode::CONFLICT,
            ),
            (
                IngestError::StorageWrite(crate::services::chunk_store::ChunkStoreError::Io(
                    std::io::Error::other("disk full"),
                )),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }
}
