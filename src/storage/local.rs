//! Local filesystem chunk backend.
//!
//! Chunks are written at their declared offset into a temp file under a
//! scratch directory scoped to the destination. Finalize verifies the
//! assembled size, then atomically moves the temp file into the
//! destination folder under the declared filename, appending a
//! disambiguating suffix instead of overwriting on collision.
//!
//! The filesystem tolerates true random-offset writes, so out-of-order
//! acceptance could be relaxed here; the coordinator still enforces
//! sequential order uniformly so both backends present one contract.

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::{debug, warn};

use super::backend::{BackendState, ChunkBackend};
use crate::errors::UploadError;
use crate::range::ChunkDescriptor;
use crate::session::store::FinalizedUpload;

/// Backend state blob for the local backend.
#[derive(Debug, Serialize, Deserialize)]
struct LocalState {
    /// Absolute path of the in-progress temp file.
    temp_path: String,
}

/// Persists chunks as offset-writes into a scratch temp file.
pub struct LocalChunkBackend {
    /// Destination name, echoed into [`FinalizedUpload`].
    destination: String,
    /// Scratch directory for in-progress temp files.
    scratch_dir: PathBuf,
    /// Folder finalized uploads are moved into.
    root_dir: PathBuf,
}

impl LocalChunkBackend {
    /// Create a backend writing scratch files under `scratch_dir` and
    /// finalizing into `root_dir`. Both directories are created if absent.
    pub fn new(
        destination: &str,
        scratch_dir: impl Into<PathBuf>,
        root_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let scratch_dir = scratch_dir.into().join(destination);
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&scratch_dir)?;
        std::fs::create_dir_all(&root_dir)?;
        Ok(Self {
            destination: destination.to_string(),
            scratch_dir,
            root_dir,
        })
    }

    fn decode_state(state: &BackendState) -> Result<LocalState, UploadError> {
        serde_json::from_value(state.clone()).map_err(|e| UploadError::BackendFailure {
            message: format!("corrupt local backend state: {e}"),
        })
    }

    fn io_failure(context: &str, err: impl std::fmt::Display) -> UploadError {
        UploadError::BackendFailure {
            message: format!("{context}: {err}"),
        }
    }

    /// Compute the MD5 ETag of a file by streaming it.
    fn file_etag(path: &Path) -> std::io::Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("\"{}\"", hex::encode(hasher.finalize())))
    }

    /// Pick a path under `root_dir` for `filename` that does not collide
    /// with an existing file: `photo.jpg`, `photo-1.jpg`, `photo-2.jpg`, ...
    fn unique_final_path(&self, filename: &str) -> PathBuf {
        let candidate = self.root_dir.join(filename);
        if !candidate.exists() {
            return candidate;
        }

        let (stem, ext) = match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (filename.to_string(), String::new()),
        };

        for n in 1.. {
            let candidate = self.root_dir.join(format!("{stem}-{n}{ext}"));
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!("suffix search is unbounded");
    }
}

impl ChunkBackend for LocalChunkBackend {
    fn begin(
        &self,
        _descriptor: &ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<BackendState, UploadError>> + Send + '_>> {
        Box::pin(async move {
            let temp_path = self
                .scratch_dir
                .join(format!("upload-{}.part", uuid::Uuid::new_v4()));

            // Reserve the file up front so abort always has something to
            // delete and concurrent begins never share a path.
            std::fs::File::create(&temp_path)
                .map_err(|e| Self::io_failure("create scratch file", e))?;

            debug!("local begin: temp={}", temp_path.display());

            let state = LocalState {
                temp_path: temp_path.to_string_lossy().into_owned(),
            };
            serde_json::to_value(&state).map_err(|e| UploadError::BackendFailure {
                message: format!("encode local backend state: {e}"),
            })
        })
    }

    fn append_chunk(
        &self,
        state: BackendState,
        descriptor: &ChunkDescriptor,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<BackendState, UploadError>> + Send + '_>> {
        let descriptor = descriptor.clone();
        Box::pin(async move {
            let local = Self::decode_state(&state)?;

            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(&local.temp_path)
                .map_err(|e| Self::io_failure("open scratch file", e))?;
            file.seek(SeekFrom::Start(descriptor.offset))
                .map_err(|e| Self::io_failure("seek scratch file", e))?;
            file.write_all(&data)
                .map_err(|e| Self::io_failure("write chunk", e))?;
            file.sync_all()
                .map_err(|e| Self::io_failure("fsync scratch file", e))?;

            debug!(
                "local append: temp={} offset={} len={}",
                local.temp_path, descriptor.offset, descriptor.chunk_length
            );

            // The temp path never changes; the state passes through as-is.
            Ok(state)
        })
    }

    fn finalize(
        &self,
        state: BackendState,
        descriptor: &ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizedUpload, UploadError>> + Send + '_>> {
        let descriptor = descriptor.clone();
        Box::pin(async move {
            let local = Self::decode_state(&state)?;
            let temp_path = PathBuf::from(&local.temp_path);

            // Defensive check against partial-write corruption.
            let actual = std::fs::metadata(&temp_path)
                .map_err(|e| Self::io_failure("stat scratch file", e))?
                .len();
            if actual != descriptor.total_length {
                return Err(UploadError::BackendFailure {
                    message: format!(
                        "assembled file is {actual} bytes, expected {}",
                        descriptor.total_length
                    ),
                });
            }

            let etag = Self::file_etag(&temp_path)
                .map_err(|e| Self::io_failure("hash assembled file", e))?;

            let final_path = self.unique_final_path(&descriptor.filename);

            // Atomic move within a filesystem; fall back to copy + remove
            // when scratch and destination live on different devices.
            if let Err(rename_err) = std::fs::rename(&temp_path, &final_path) {
                std::fs::copy(&temp_path, &final_path)
                    .map_err(|e| Self::io_failure("copy assembled file", e))?;
                std::fs::remove_file(&temp_path).map_err(|e| {
                    Self::io_failure("remove scratch file after cross-device copy", e)
                })?;
                debug!(
                    "local finalize: rename failed ({rename_err}), copied to {}",
                    final_path.display()
                );
            }

            debug!(
                "local finalize: {} -> {}",
                local.temp_path,
                final_path.display()
            );

            Ok(FinalizedUpload {
                destination: self.destination.clone(),
                location: final_path.to_string_lossy().into_owned(),
                total_length: descriptor.total_length,
                mime_type: descriptor.mime_type_hint.clone(),
                etag,
            })
        })
    }

    fn abort(
        &self,
        state: BackendState,
    ) -> Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + '_>> {
        Box::pin(async move {
            let local = Self::decode_state(&state)?;
            let temp_path = PathBuf::from(&local.temp_path);

            if temp_path.exists() {
                if let Err(e) = std::fs::remove_file(&temp_path) {
                    // Failure to delete scratch is logged, not escalated.
                    warn!("failed to delete scratch file {}: {}", local.temp_path, e);
                }
            }
            Ok(())
        })
    }
}

// -- Tests --------------------------------------------------------------------
