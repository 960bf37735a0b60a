//! Axum router construction and upload route mapping.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::generate_request_id;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the ChunkGate upload API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "ChunkGate Upload API",
        version = "0.1.0",
        description = "Chunked-upload HTTP gateway with local and S3 multipart backends"
    ),
    paths(
        health_check,
        crate::handlers::upload::submit_upload,
        crate::handlers::upload::upload_status,
        crate::handlers::upload::cancel_upload,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Chunked upload operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all upload routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    // A single chunk body can never legitimately exceed the configured
    // chunk limit; reject larger bodies before buffering them.
    let body_limit = state.config.server.max_chunk_size as usize;

    let mut router = Router::new();
    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        // Prometheus metrics endpoint.
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        // OpenAPI spec.
        .route("/openapi.json", get(openapi_spec))
        // Chunk submission (or whole-file upload).
        .route(
            "/uploads/:destination",
            post(crate::handlers::upload::submit_upload),
        )
        // Session probe and cancel.
        .route(
            "/uploads/:destination/:filename/:total",
            get(crate::handlers::upload::upload_status)
                .delete(crate::handlers::upload::cancel_upload),
        )
        // Application state shared across all handlers.
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        // Per-request tracing spans, then standard response headers.
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(common_headers_middleware))
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
}

// -- Common headers middleware -----------------------------------------------

/// Tower middleware that adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `ChunkGate`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Only set x-request-id if not already present (error handler may set it).
    if !headers.contains_key("x-request-id") {
        let request_id = generate_request_id();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    // Always overwrite Date and Server to ensure consistency.
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("ChunkGate"));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- Serve the OpenAPI document.
async fn openapi_spec() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::UploadCoordinator;
    use crate::session::memory::MemorySessionStore;
    use crate::storage::local::LocalChunkBackend;
    use crate::storage::BackendSelector;
    use axum::body::Body;
    use tower::ServiceExt;

    /// Router over a tempdir local backend and a memory session store.
    fn test_app() -> (tempfile::TempDir, tempfile::TempDir, Router) {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let backend = LocalChunkBackend::new("media", scratch.path(), dest.path()).unwrap();
        let selector =
            BackendSelector::default().with_backend("media", Arc::new(backend));

        let config: crate::config::Config = serde_yaml::from_str("{}").unwrap();
        let coordinator = Arc::new(UploadCoordinator::new(
            Arc::new(MemorySessionStore::new()),
            selector,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(3600),
            config.server.max_upload_size,
        ));

        let state = Arc::new(AppState {
            config,
            coordinator,
        });
        (scratch, dest, app(state))
    }

    fn chunk_request(
        destination: &str,
        filename: &str,
        offset: u64,
        total: u64,
        body: &'static [u8],
    ) -> Request<Body> {
        let end = offset + body.len() as u64 - 1;
        Request::builder()
            .method("POST")
            .uri(format!("/uploads/{destination}"))
            .header("content-range", format!("bytes {offset}-{end}/{total}"))
            .header(
                "content-disposition",
                format!("attachment; filename=\"{filename}\""),
            )
            .header("content-type", "application/octet-stream")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_s, _d, app) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["server"], "ChunkGate");
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_openapi_spec_served() {
        let (_s, _d, app) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["info"]["title"], "ChunkGate Upload API");
        // The chunk submission operation documents its raw-bytes body.
        assert!(json["paths"]["/uploads/{destination}"]["post"]["requestBody"]["content"]
            .get("application/octet-stream")
            .is_some());
    }

    #[tokio::test]
    async fn test_chunked_upload_accepted_then_created() {
        let (_s, dest, app) = test_app();

        let response = app
            .clone()
            .oneshot(chunk_request("media", "file.bin", 0, 10, b"abcd"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "pending");
        assert_eq!(json["bytes_received"], 4);
        assert_eq!(json["total_length"], 10);

        let response = app
            .oneshot(chunk_request("media", "file.bin", 4, 10, b"efghij"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "complete");
        assert_eq!(json["total_length"], 10);

        let location = json["location"].as_str().unwrap();
        assert_eq!(std::fs::read(location).unwrap(), b"abcdefghij");
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_whole_file_upload_completes_immediately() {
        let (_s, _d, app) = test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/uploads/media")
            .header("content-disposition", "attachment; filename=\"one.txt\"")
            .header("content-type", "text/plain")
            .body(Body::from("hello"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "complete");
        assert_eq!(json["total_length"], 5);
        assert_eq!(json["mime_type"], "text/plain");
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_is_bad_request() {
        let (_s, _d, app) = test_app();

        app.clone()
            .oneshot(chunk_request("media", "file.bin", 0, 10, b"abcd"))
            .await
            .unwrap();

        let response = app
            .oneshot(chunk_request("media", "file.bin", 6, 10, b"wxyz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["code"], "OutOfOrderChunk");
        assert_eq!(json["retryable"], false);
    }

    #[tokio::test]
    async fn test_malformed_content_range_is_bad_request() {
        let (_s, _d, app) = test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/uploads/media")
            .header("content-range", "bytes nonsense")
            .header("content-disposition", "attachment; filename=\"f.bin\"")
            .body(Body::from("abcd"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["code"], "MalformedRange");
    }

    #[tokio::test]
    async fn test_unknown_destination_is_not_found() {
        let (_s, _d, app) = test_app();

        let response = app
            .oneshot(chunk_request("nowhere", "file.bin", 0, 10, b"abcd"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["code"], "UnknownDestination");
    }

    #[tokio::test]
    async fn test_status_probe_and_cancel() {
        let (_s, _d, app) = test_app();

        app.clone()
            .oneshot(chunk_request("media", "file.bin", 0, 10, b"abcd"))
            .await
            .unwrap();

        // Probe reports progress.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/uploads/media/file.bin/10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["bytes_received"], 4);
        assert_eq!(json["status"], "open");

        // Cancel removes the session.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/uploads/media/file.bin/10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Probe now misses.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/uploads/media/file.bin/10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_probe_unknown_session_is_not_found() {
        let (_s, _d, app) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/uploads/media/nope.bin/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
