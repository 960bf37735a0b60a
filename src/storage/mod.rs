//! Chunk storage backends and the destination-to-backend selector.

pub mod backend;
pub mod bucket;
pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, StorageKind};
use backend::ChunkBackend;

/// Maps destination names to their backend instances.
///
/// The mapping is a pure function of configuration, built once at startup;
/// it holds no upload state and takes no part in the state machine.
#[derive(Default)]
pub struct BackendSelector {
    backends: HashMap<String, Arc<dyn ChunkBackend>>,
}

impl BackendSelector {
    /// Build one backend per configured destination.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut backends: HashMap<String, Arc<dyn ChunkBackend>> = HashMap::new();

        for dest in &config.destinations {
            let backend: Arc<dyn ChunkBackend> = match dest.kind {
                StorageKind::Local => {
                    let local_cfg = dest.local.as_ref().ok_or_else(|| {
                        anyhow::anyhow!(
                            "destination '{}' is kind 'local' but has no local section",
                            dest.name
                        )
                    })?;
                    Arc::new(local::LocalChunkBackend::new(
                        &dest.name,
                        &config.upload.scratch_dir,
                        &local_cfg.root_dir,
                    )?)
                }
                StorageKind::Bucket => {
                    let bucket_cfg = dest.bucket.as_ref().ok_or_else(|| {
                        anyhow::anyhow!(
                            "destination '{}' is kind 'bucket' but has no bucket section",
                            dest.name
                        )
                    })?;
                    Arc::new(
                        bucket::BucketChunkBackend::new(
                            &dest.name,
                            bucket_cfg,
                            config.upload.min_part_size,
                        )
                        .await?,
                    )
                }
            };
            backends.insert(dest.name.clone(), backend);
        }

        Ok(Self { backends })
    }

    /// Register a backend under a destination name. Used by tests to inject
    /// fakes.
    pub fn with_backend(mut self, name: &str, backend: Arc<dyn ChunkBackend>) -> Self {
        self.backends.insert(name.to_string(), backend);
        self
    }

    /// Select the backend for a destination, if one is configured.
    pub fn select(&self, destination: &str) -> Option<Arc<dyn ChunkBackend>> {
        self.backends.get(destination).cloned()
    }
}
