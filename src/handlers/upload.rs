//! Upload API handlers.
//!
//! `POST /uploads/{destination}` accepts either a chunk (Content-Range +
//! Content-Disposition present) or a whole file in one request (neither
//! header present, treated as a single terminal chunk).  Chunk acceptance
//! answers 202 with progress; the request that completes the upload
//! answers 201 with the finalized result.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::coordinator::SubmitOutcome;
use crate::errors::UploadError;
use crate::range::{parse_chunk_headers, parse_disposition_filename, ChunkDescriptor};
use crate::session::store::FinalizedUpload;
use crate::AppState;

/// Render the 202 body for an accepted, incomplete chunk.
fn pending_response(bytes_received: u64, total_length: u64) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "pending",
            "bytes_received": bytes_received,
            "total_length": total_length,
        })),
    )
        .into_response()
}

/// Render the 201 body for a finalized upload.
fn complete_response(result: &FinalizedUpload) -> Response {
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "complete",
            "destination": result.destination,
            "location": result.location,
            "total_length": result.total_length,
            "mime_type": result.mime_type,
            "etag": result.etag,
        })),
    )
        .into_response()
}

/// Build the descriptor for a request without chunk headers: the whole
/// file arrives as one terminal chunk.
fn whole_file_descriptor(
    headers: &HeaderMap,
    body_len: u64,
) -> Result<ChunkDescriptor, UploadError> {
    let disposition = headers
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| UploadError::MalformedRange {
            message: "missing Content-Disposition filename for non-chunked upload".to_string(),
        })?;
    let filename = parse_disposition_filename(disposition)?;
    let mime_type_hint = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    Ok(ChunkDescriptor {
        offset: 0,
        chunk_length: body_len,
        total_length: body_len,
        filename,
        mime_type_hint,
    })
}

/// `POST /uploads/{destination}` -- Submit a chunk (or a whole file).
#[utoipa::path(
    post,
    path = "/uploads/{destination}",
    tag = "Upload",
    operation_id = "SubmitChunk",
    params(("destination" = String, Path, description = "Configured destination name")),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 202, description = "Chunk accepted, upload incomplete"),
        (status = 201, description = "Upload complete"),
        (status = 400, description = "Malformed, out-of-order, too-small, or oversized chunk"),
        (status = 404, description = "Unknown destination"),
        (status = 409, description = "Session already completed"),
        (status = 502, description = "Storage backend failure"),
        (status = 504, description = "Storage backend timeout")
    )
)]
pub async fn submit_upload(
    State(state): State<Arc<AppState>>,
    Path(destination): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, UploadError> {
    let descriptor = match parse_chunk_headers(&headers)? {
        Some(descriptor) => descriptor,
        None => whole_file_descriptor(&headers, body.len() as u64)?,
    };

    debug!(
        "chunk submit: destination={} file={} offset={} len={} total={}",
        destination,
        descriptor.filename,
        descriptor.offset,
        descriptor.chunk_length,
        descriptor.total_length
    );

    match state
        .coordinator
        .submit(&destination, &descriptor, body)
        .await?
    {
        SubmitOutcome::Pending {
            bytes_received,
            total_length,
        } => Ok(pending_response(bytes_received, total_length)),
        SubmitOutcome::Complete(result) => Ok(complete_response(&result)),
    }
}

/// `GET /uploads/{destination}/{filename}/{total}` -- Probe session state.
///
/// Lets a resuming client discover how many bytes the server already holds
/// before re-sending anything.
#[utoipa::path(
    get,
    path = "/uploads/{destination}/{filename}/{total}",
    tag = "Upload",
    operation_id = "UploadStatus",
    params(
        ("destination" = String, Path, description = "Configured destination name"),
        ("filename" = String, Path, description = "Sanitized target filename"),
        ("total" = u64, Path, description = "Declared total length in bytes")
    ),
    responses(
        (status = 200, description = "Session state"),
        (status = 404, description = "No session for this upload")
    )
)]
pub async fn upload_status(
    State(state): State<Arc<AppState>>,
    Path((destination, filename, total)): Path<(String, String, u64)>,
) -> Result<Response, UploadError> {
    match state.coordinator.status(&destination, &filename, total).await? {
        Some(summary) => Ok((StatusCode::OK, Json(summary)).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "not_found" })),
        )
            .into_response()),
    }
}

/// `DELETE /uploads/{destination}/{filename}/{total}` -- Cancel an upload.
///
/// Aborts backend state and removes the session; the same key then starts
/// fresh.
#[utoipa::path(
    delete,
    path = "/uploads/{destination}/{filename}/{total}",
    tag = "Upload",
    operation_id = "CancelUpload",
    params(
        ("destination" = String, Path, description = "Configured destination name"),
        ("filename" = String, Path, description = "Sanitized target filename"),
        ("total" = u64, Path, description = "Declared total length in bytes")
    ),
    responses(
        (status = 204, description = "Session removed"),
        (status = 404, description = "No session for this upload")
    )
)]
pub async fn cancel_upload(
    State(state): State<Arc<AppState>>,
    Path((destination, filename, total)): Path<(String, String, u64)>,
) -> Result<Response, UploadError> {
    if state.coordinator.cancel(&destination, &filename, total).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "not_found" })),
        )
            .into_response())
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_whole_file_descriptor() {
        let h = headers(&[
            ("content-disposition", "attachment; filename=\"photo.jpg\""),
            ("content-type", "image/jpeg"),
        ]);
        let d = whole_file_descriptor(&h, 1024).unwrap();
        assert_eq!(d.offset, 0);
        assert_eq!(d.chunk_length, 1024);
        assert_eq!(d.total_length, 1024);
        assert_eq!(d.filename, "photo.jpg");
        assert_eq!(d.mime_type_hint, "image/jpeg");
        assert!(d.is_terminal());
    }

    #[test]
    fn test_whole_file_requires_filename() {
        let h = headers(&[("content-type", "image/jpeg")]);
        let err = whole_file_descriptor(&h, 1024).unwrap_err();
        assert_eq!(err.code(), "MalformedRange");
    }
}
