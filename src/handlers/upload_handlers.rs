//! HTTP handlers for chunk uploads and upload status.
//! Bodies are handed to the coordinator; all validation and state changes
//! live there.

use crate::{
    errors::AppError,
    models::upload::{UploadSession, UploadStage},
    services::coordinator::{AcceptResult, ChunkMeta},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, Request, State, multipart::MultipartError},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;

/// Header naming the uploader; identity itself is established upstream.
pub const UPLOADER_HEADER: &str = "x-uploader";

const ANONYMOUS: &str = "anonymous";

/// Query params for the raw-body chunk endpoint.
#[derive(Debug, Deserialize)]
pub struct RawChunkQuery {
    pub total_chunks: i64,
    pub file_name: String,
}

#[derive(Debug, Serialize)]
pub struct ChunkAccepted {
    pub message: String,
    #[serde(flatten)]
    pub result: AcceptResult,
}

#[derive(Debug, Serialize)]
pub struct UploadStatus {
    #[serde(flatten)]
    pub session: UploadSession,
    pub missing_chunks: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct RetryAccepted {
    pub upload_id: String,
    pub stage: UploadStage,
}

/// `POST /uploads/chunk`: multipart form with `upload_id`, `chunk_number`,
/// `total_chunks`, `file_name` and the chunk bytes in `file`.
pub async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut upload_id = None;
    let mut chunk_number = None;
    let mut total_chunks = None;
    let mut file_name = None;
    let mut payload: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "upload_id" => upload_id = Some(field.text().await.map_err(multipart_error)?),
            "chunk_number" => {
                let text = field.text().await.map_err(multipart_error)?;
                chunk_number = Some(parse_number("chunk_number", &text)?);
            }
            "total_chunks" => {
                let text = field.text().await.map_err(multipart_error)?;
                total_chunks = Some(parse_number("total_chunks", &text)?);
            }
            "file_name" => file_name = Some(field.text().await.map_err(multipart_error)?),
            "file" => payload = Some(field.bytes().await.map_err(multipart_error)?),
            _ => {}
        }
    }

    let meta = ChunkMeta {
        upload_id: upload_id.ok_or_else(|| missing("upload_id"))?,
        index: chunk_number.ok_or_else(|| missing("chunk_number"))?,
        total_chunks: total_chunks.ok_or_else(|| missing("total_chunks"))?,
        file_name: file_name.ok_or_else(|| missing("file_name"))?,
        uploader: uploader(&headers),
    };
    let payload = payload.ok_or_else(|| missing("file"))?;

    let result = state.coordinator.accept_chunk(meta, payload).await?;
    Ok(Json(accepted(result)))
}

/// `PUT /uploads/{upload_id}/chunks/{index}?total_chunks=&file_name=`:
/// the request body is the chunk, streamed straight to the staging area.
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, i64)>,
    Query(query): Query<RawChunkQuery>,
    headers: HeaderMap,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > state.max_chunk_bytes) {
        return Err(AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("chunk exceeds {} bytes", state.max_chunk_bytes),
        ));
    }

    let meta = ChunkMeta {
        upload_id,
        index,
        total_chunks: query.total_chunks,
        file_name: query.file_name,
        uploader: uploader(&headers),
    };
    // Bodies without a Content-Length are cut off once they pass the cap.
    let limit = state.max_chunk_bytes;
    let mut seen = 0usize;
    let stream = request.into_body().into_data_stream().map(move |chunk| {
        let chunk = chunk.map_err(io::Error::other)?;
        seen += chunk.len();
        if seen > limit {
            return Err(io::Error::new(
                io::ErrorKind::FileTooLarge,
                format!("chunk exceeds {} bytes", limit),
            ));
        }
        Ok(chunk)
    });

    let result = state.coordinator.accept_chunk_stream(meta, stream).await?;
    Ok(Json(accepted(result)))
}

/// `GET /uploads/{upload_id}`: progress and pipeline stage.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.coordinator.status(&upload_id).await?;
    let missing_chunks = session.missing_chunks();
    Ok(Json(UploadStatus {
        session,
        missing_chunks,
    }))
}

/// `POST /uploads/{upload_id}/retry`: restart a failed pipeline stage.
pub async fn retry_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let stage = state.coordinator.retry(&upload_id).await?;
    Ok((StatusCode::ACCEPTED, Json(RetryAccepted { upload_id, stage })))
}

fn accepted(result: AcceptResult) -> ChunkAccepted {
    ChunkAccepted {
        message: format!("Chunk {} uploaded", result.chunk_index),
        result,
    }
}

fn uploader(headers: &HeaderMap) -> String {
    headers
        .get(UPLOADER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

fn parse_number(field: &str, value: &str) -> Result<i64, AppError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| AppError::bad_request(format!("field `{}` must be an integer", field)))
}

fn missing(field: &str) -> AppError {
    AppError::bad_request(format!("missing form field `{}`", field))
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}
