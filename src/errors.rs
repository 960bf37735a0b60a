//! Upload error taxonomy.
//!
//! Every variant maps to a stable wire code and an HTTP status.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(UploadError::OutOfOrderChunk { .. })`.  Backend-specific
//! error types (IO, AWS SDK) are translated into this taxonomy at the
//! coordinator boundary and never leak to callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Protocol and storage errors surfaced to upload clients.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The Content-Range / Content-Disposition headers were unparsable or
    /// internally inconsistent.
    #[error("{message}")]
    MalformedRange { message: String },

    /// The chunk's offset does not match the bytes received so far.
    /// Partial state cannot be salvaged; the client must restart from chunk 0.
    #[error("chunk offset {offset} does not match bytes received {bytes_received}; restart the upload")]
    OutOfOrderChunk { offset: u64, bytes_received: u64 },

    /// A non-terminal chunk was smaller than the backend's minimum part size.
    #[error("chunk of {chunk_length} bytes is below the minimum part size {min_part_size}; only the final chunk may be smaller")]
    ChunkTooSmall {
        chunk_length: u64,
        min_part_size: u64,
    },

    /// A chunk arrived for a session that already completed or aborted.
    #[error("upload session {session_id} is no longer open")]
    StaleSession { session_id: String },

    /// The destination name is not present in the configuration.
    #[error("unknown upload destination: {name}")]
    UnknownDestination { name: String },

    /// The declared total length exceeds the configured maximum.
    #[error("declared upload size {total_length} exceeds the maximum allowed {max_upload_size}")]
    EntityTooLarge {
        total_length: u64,
        max_upload_size: u64,
    },

    /// A backend call exceeded its bounded timeout. Retryable as-is.
    #[error("storage backend did not respond in time; retry the chunk")]
    BackendTimeout,

    /// The storage backend failed (disk full, remote 5xx). The session has
    /// been aborted; the client must restart the upload.
    #[error("storage backend failure: {message}")]
    BackendFailure { message: String },

    /// Catch-all for unexpected internal errors.
    #[error("internal error, please try again")]
    Internal(#[from] anyhow::Error),
}

impl UploadError {
    /// Return the stable wire code string.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::MalformedRange { .. } => "MalformedRange",
            UploadError::OutOfOrderChunk { .. } => "OutOfOrderChunk",
            UploadError::ChunkTooSmall { .. } => "ChunkTooSmall",
            UploadError::StaleSession { .. } => "StaleSession",
            UploadError::UnknownDestination { .. } => "UnknownDestination",
            UploadError::EntityTooLarge { .. } => "EntityTooLarge",
            UploadError::BackendTimeout => "BackendTimeout",
            UploadError::BackendFailure { .. } => "BackendFailure",
            UploadError::Internal(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::MalformedRange { .. } => StatusCode::BAD_REQUEST,
            UploadError::OutOfOrderChunk { .. } => StatusCode::BAD_REQUEST,
            UploadError::ChunkTooSmall { .. } => StatusCode::BAD_REQUEST,
            UploadError::StaleSession { .. } => StatusCode::CONFLICT,
            UploadError::UnknownDestination { .. } => StatusCode::NOT_FOUND,
            UploadError::EntityTooLarge { .. } => StatusCode::BAD_REQUEST,
            UploadError::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            UploadError::BackendFailure { .. } => StatusCode::BAD_GATEWAY,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client may retry the same chunk without restarting the
    /// logical upload.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::BackendTimeout)
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
            "request_id": request_id,
        });

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-request-id", request_id),
                ("date", date),
                ("server", "ChunkGate".to_string()),
            ],
            body.to_string(),
        )
            .into_response()
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_uppercase());
    }

    #[test]
    fn test_status_codes() {
        let err = UploadError::OutOfOrderChunk {
            offset: 10,
            bytes_received: 0,
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "OutOfOrderChunk");

        assert_eq!(
            UploadError::BackendTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            UploadError::StaleSession {
                session_id: "abc".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_only_timeout_is_retryable() {
        assert!(UploadError::BackendTimeout.is_retryable());
        assert!(!UploadError::BackendFailure {
            message: "disk full".into()
        }
        .is_retryable());
        assert!(!UploadError::MalformedRange {
            message: "bad".into()
        }
        .is_retryable());
    }
}
