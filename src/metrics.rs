//! Prometheus metrics for ChunkGate.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "chunkgate_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "chunkgate_http_request_duration_seconds";

/// Chunks accepted and persisted (counter).
pub const CHUNKS_RECEIVED_TOTAL: &str = "chunkgate_chunks_received_total";

/// Already-covered chunks replayed as no-ops (counter).
pub const CHUNKS_REPLAYED_TOTAL: &str = "chunkgate_chunks_replayed_total";

/// Payload bytes persisted through backends (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "chunkgate_bytes_received_total";

/// Uploads finalized at their destination (counter).
pub const UPLOADS_COMPLETED_TOTAL: &str = "chunkgate_uploads_completed_total";

/// Uploads aborted on failure or cancel (counter).
pub const UPLOADS_ABORTED_TOTAL: &str = "chunkgate_uploads_aborted_total";

/// Sessions removed by the idle sweep (counter).
pub const SESSIONS_SWEPT_TOTAL: &str = "chunkgate_sessions_swept_total";

/// Currently open upload sessions (gauge).
pub const SESSIONS_OPEN: &str = "chunkgate_sessions_open";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(CHUNKS_RECEIVED_TOTAL, "Chunks accepted and persisted");
    describe_counter!(
        CHUNKS_REPLAYED_TOTAL,
        "Already-covered chunks replayed as no-ops"
    );
    describe_counter!(
        BYTES_RECEIVED_TOTAL,
        "Payload bytes persisted through backends"
    );
    describe_counter!(
        UPLOADS_COMPLETED_TOTAL,
        "Uploads finalized at their destination"
    );
    describe_counter!(UPLOADS_ABORTED_TOTAL, "Uploads aborted on failure or cancel");
    describe_counter!(SESSIONS_SWEPT_TOTAL, "Sessions removed by the idle sweep");
    describe_gauge!(SESSIONS_OPEN, "Currently open upload sessions");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    // Do not instrument the metrics endpoint itself.
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// This prevents high-cardinality labels from unique destination/filename
/// values.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/openapi.json` -> `/openapi.json`
/// - `/uploads/media` -> `/uploads/{destination}`
/// - `/uploads/media/clip.mp4/1048576` -> `/uploads/{destination}/{filename}/{total}`
/// - `/` -> `/`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/openapi.json" | "/metrics" => path.to_string(),
        _ => {
            let trimmed = path.trim_start_matches('/');
            if trimmed.is_empty() {
                return "/".to_string();
            }
            let mut segments = trimmed.split('/');
            if segments.next() != Some("uploads") {
                return "/{other}".to_string();
            }
            match segments.next() {
                None => "/uploads".to_string(),
                Some(_) if segments.next().is_none() => "/uploads/{destination}".to_string(),
                Some(_) => "/uploads/{destination}/{filename}/{total}".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = PROMETHEUS_HANDLE
        .get()
        .expect("Prometheus recorder not initialized");
    let body = handle.render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_root() {
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_normalize_path_health() {
        assert_eq!(normalize_path("/health"), "/health");
    }

    #[test]
    fn test_normalize_path_openapi() {
        assert_eq!(normalize_path("/openapi.json"), "/openapi.json");
    }

    #[test]
    fn test_normalize_path_upload_post() {
        assert_eq!(normalize_path("/uploads/media"), "/uploads/{destination}");
        assert_eq!(
            normalize_path("/uploads/archive-2"),
            "/uploads/{destination}"
        );
    }

    #[test]
    fn test_normalize_path_upload_status() {
        assert_eq!(
            normalize_path("/uploads/media/clip.mp4/1048576"),
            "/uploads/{destination}/{filename}/{total}"
        );
    }

    #[test]
    fn test_normalize_path_unknown() {
        assert_eq!(normalize_path("/something/else"), "/{other}");
    }
}
