//! ChunkGate: a chunked-upload HTTP gateway.
//!
//! This crate provides the core components for running a chunked-upload
//! server: Content-Range parsing, durable upload sessions, the upload
//! coordinator state machine, and pluggable storage backends (local
//! filesystem and S3-compatible multipart).

use std::sync::Arc;

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod range;
pub mod server;
pub mod session;
pub mod storage;

use crate::config::Config;
use crate::coordinator::UploadCoordinator;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The upload coordinator owning all protocol state.
    pub coordinator: Arc<UploadCoordinator>,
}
