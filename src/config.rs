//! Configuration loading and types for ChunkGate.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, upload protocol limits, session persistence, and
//! the set of named upload destinations.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Chunked-upload protocol settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Session store settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Named upload destinations.
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Look up a destination by name.
    pub fn destination(&self, name: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.name == name)
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum declared total upload size in bytes (default 5 GiB).
    /// The server is the sole authority; client-declared limits are advisory.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    /// Maximum size of a single chunk body in bytes (default 64 MiB).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_upload_size: default_max_upload_size(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// Chunked-upload protocol configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Minimum part size for non-terminal chunks on the bucket backend
    /// (S3 requires 5 MiB).
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,

    /// Bounded timeout for any single backend call, in seconds.
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,

    /// Sessions idle longer than this are swept away, in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Interval between idle-session sweeps, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Scratch directory for in-progress local uploads.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_part_size: default_min_part_size(),
            backend_timeout_secs: default_backend_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Store engine: `sqlite` (durable) or `memory` (ephemeral).
    #[serde(default = "default_session_engine")]
    pub engine: String,

    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: default_session_engine(),
            sqlite: SqliteConfig::default(),
        }
    }
}

/// SQLite-specific session store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_session_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_session_path(),
        }
    }
}

/// Storage kind for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Local filesystem, supports random-offset writes.
    Local,
    /// Remote object store, append-once multipart parts.
    Bucket,
}

/// A named upload destination.
///
/// Credentials and paths arrive here as opaque configuration; the upload
/// core never resolves them itself.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    /// Destination name used in request paths.
    pub name: String,

    /// Which backend persists uploads for this destination.
    pub kind: StorageKind,

    /// Local filesystem settings (required when `kind` is `local`).
    #[serde(default)]
    pub local: Option<LocalDestinationConfig>,

    /// Object store settings (required when `kind` is `bucket`).
    #[serde(default)]
    pub bucket: Option<BucketDestinationConfig>,
}

/// Local filesystem destination settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalDestinationConfig {
    /// Folder finalized uploads are moved into.
    pub root_dir: String,
}

/// Object store destination settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketDestinationConfig {
    /// Backing bucket name.
    pub bucket: String,
    /// Key prefix in the backing bucket.
    #[serde(default)]
    pub prefix: String,
    /// Bucket region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` probe.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9440
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_upload_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_max_chunk_size() -> u64 {
    67_108_864 // 64 MiB
}

fn default_min_part_size() -> u64 {
    5_242_880 // 5 MiB, the S3 multipart minimum
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_scratch_dir() -> String {
    "./data/scratch".to_string()
}

fn default_session_engine() -> String {
    "sqlite".to_string()
}

fn default_session_path() -> String {
    "./data/sessions.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 9440);
        assert_eq!(config.upload.min_part_size, 5_242_880);
        assert_eq!(config.session.engine, "sqlite");
        assert!(config.destinations.is_empty());
    }

    #[test]
    fn test_destination_lookup() {
        let yaml = r#"
destinations:
  - name: media
    kind: local
    local:
      root_dir: /srv/media
  - name: archive
    kind: bucket
    bucket:
      bucket: my-archive
      prefix: uploads/
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.destinations.len(), 2);

        let media = config.destination("media").unwrap();
        assert_eq!(media.kind, StorageKind::Local);
        assert_eq!(media.local.as_ref().unwrap().root_dir, "/srv/media");

        let archive = config.destination("archive").unwrap();
        assert_eq!(archive.kind, StorageKind::Bucket);
        assert_eq!(archive.bucket.as_ref().unwrap().region, "us-east-1");

        assert!(config.destination("missing").is_none());
    }

    #[test]
    fn test_upload_overrides() {
        let yaml = r#"
upload:
  min_part_size: 1024
  idle_timeout_secs: 60
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.upload.min_part_size, 1024);
        assert_eq!(config.upload.idle_timeout_secs, 60);
        // Untouched fields keep their defaults.
        assert_eq!(config.upload.sweep_interval_secs, 300);
    }
}
