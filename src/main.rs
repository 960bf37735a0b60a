//! ChunkGate -- chunked-upload HTTP gateway.
//!
//! Crash-only design: sessions live in SQLite, so a restart resumes
//! half-finished uploads where they left off. SIGTERM/SIGINT handlers only
//! stop accepting connections and wait for in-flight requests -- no cleanup;
//! the idle sweep reclaims whatever a crash left behind.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

/// Command-line arguments for the ChunkGate server.
#[derive(Parser, Debug)]
#[command(
    name = "chunkgate",
    version,
    about = "Chunked-upload HTTP gateway with local and S3 multipart backends"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "chunkgate.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = chunkgate::config::load_config(&cli.config)?;

    // Initialize tracing / logging. RUST_LOG overrides the config level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("Configuration loaded from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.destinations.is_empty() {
        warn!("no destinations configured; every upload will be rejected");
    }

    // Initialize Prometheus metrics recorder and register metric descriptions.
    if config.observability.metrics {
        chunkgate::metrics::init_metrics();
        chunkgate::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Initialize the session store.
    let store: Arc<dyn chunkgate::session::store::SessionStore> =
        match config.session.engine.as_str() {
            "memory" => {
                info!("In-memory session store initialized (sessions lost on restart)");
                Arc::new(chunkgate::session::memory::MemorySessionStore::new())
            }
            "sqlite" => {
                let db_path = &config.session.sqlite.path;
                // Ensure the parent directory exists for the SQLite file.
                if let Some(parent) = std::path::Path::new(db_path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let store = chunkgate::session::sqlite::SqliteSessionStore::new(db_path)?;
                info!("SQLite session store initialized at {}", db_path);
                Arc::new(store)
            }
            other => anyhow::bail!("unknown session engine: {other} (expected sqlite or memory)"),
        };

    // Build one storage backend per configured destination.
    let selector = chunkgate::storage::BackendSelector::from_config(&config).await?;
    info!(
        "{} destination(s) configured: {}",
        config.destinations.len(),
        config
            .destinations
            .iter()
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let coordinator = Arc::new(chunkgate::coordinator::UploadCoordinator::new(
        store,
        selector,
        std::time::Duration::from_secs(config.upload.backend_timeout_secs),
        std::time::Duration::from_secs(config.upload.idle_timeout_secs),
        config.server.max_upload_size,
    ));

    // Background idle sweep: reclaims abandoned sessions and their backend
    // state (temp files, unfinished multipart uploads).
    let sweep_interval = std::time::Duration::from_secs(config.upload.sweep_interval_secs);
    let sweeper = coordinator.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        // The immediate first tick covers whatever a previous crash left.
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep_idle().await {
                warn!("idle sweep failed: {e}");
            }
        }
    });

    // Build AppState.
    let state = Arc::new(chunkgate::AppState {
        config: config.clone(),
        coordinator,
    });

    let app = chunkgate::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("ChunkGate listening on {}", bind_addr);

    // Graceful shutdown: on SIGTERM/SIGINT, stop accepting new connections,
    // wait for in-flight requests to complete, then exit. Open sessions stay
    // in the store and resume after restart.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ChunkGate shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
