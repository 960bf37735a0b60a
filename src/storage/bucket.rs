//! Remote object-store chunk backend (S3 multipart uploads).
//!
//! Chunks become parts of a server-side multipart upload: `begin` issues
//! CreateMultipartUpload, `append_chunk` uploads the next sequential part
//! and accumulates `(part_number, etag)` pairs in the backend state, and
//! `finalize` issues CompleteMultipartUpload with the ordered part list.
//!
//! Multipart uploads that are never completed or aborted remain a billed
//! liability on the remote store indefinitely, so `abort` is invoked on
//! every failure path and retried by the idle sweep.
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role) unless the destination
//! configures explicit keys.

use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, warn};

use super::backend::{BackendState, ChunkBackend};
use crate::config::BucketDestinationConfig;
use crate::errors::UploadError;
use crate::range::ChunkDescriptor;
use crate::session::store::FinalizedUpload;

/// Backend state blob for the bucket backend.
#[derive(Debug, Serialize, Deserialize)]
struct BucketState {
    /// Server-assigned multipart upload id.
    upload_id: String,
    /// Object key the upload assembles into.
    key: String,
    /// Ordered `(part_number, etag)` pairs uploaded so far.
    parts: Vec<(u32, String)>,
}

/// Enforce the object store's minimum part size.
///
/// Every chunk except the terminal one must be at least `min_part_size`
/// bytes; the store would reject the eventual CompleteMultipartUpload
/// otherwise, long after the client stopped sending.
pub fn validate_part_size(
    descriptor: &ChunkDescriptor,
    min_part_size: u64,
) -> Result<(), UploadError> {
    if !descriptor.is_terminal() && descriptor.chunk_length < min_part_size {
        return Err(UploadError::ChunkTooSmall {
            chunk_length: descriptor.chunk_length,
            min_part_size,
        });
    }
    Ok(())
}

/// Persists chunks as parts of a remote multipart upload.
pub struct BucketChunkBackend {
    /// Destination name, echoed into [`FinalizedUpload`].
    destination: String,
    /// AWS S3 SDK client.
    client: Client,
    /// The remote bucket name.
    bucket: String,
    /// Key prefix for uploads in the remote bucket.
    prefix: String,
    /// Minimum size for non-terminal parts.
    min_part_size: u64,
}

impl BucketChunkBackend {
    /// Create a bucket backend for one destination.
    ///
    /// Loads credentials from the default chain unless the destination
    /// configures explicit keys.
    pub async fn new(
        destination: &str,
        cfg: &BucketDestinationConfig,
        min_part_size: u64,
    ) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.region.clone()));

        if !cfg.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&cfg.endpoint_url);
        }

        if !cfg.access_key_id.is_empty() && !cfg.secret_access_key.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &cfg.access_key_id,
                &cfg.secret_access_key,
                None, // session_token
                None, // expiry
                "chunkgate-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(cfg.use_path_style)
            .build();
        let client = Client::from_conf(s3_config);

        info!(
            "bucket backend initialized: destination={} bucket={} prefix='{}'",
            destination, cfg.bucket, cfg.prefix
        );

        Ok(Self {
            destination: destination.to_string(),
            client,
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.clone(),
            min_part_size,
        })
    }

    fn decode_state(state: &BackendState) -> Result<BucketState, UploadError> {
        serde_json::from_value(state.clone()).map_err(|e| UploadError::BackendFailure {
            message: format!("corrupt bucket backend state: {e}"),
        })
    }

    fn encode_state(state: &BucketState) -> Result<BackendState, UploadError> {
        serde_json::to_value(state).map_err(|e| UploadError::BackendFailure {
            message: format!("encode bucket backend state: {e}"),
        })
    }

    fn sdk_failure(context: &str, err: impl std::fmt::Display) -> UploadError {
        UploadError::BackendFailure {
            message: format!("S3 {context}: {err}"),
        }
    }

    /// Map a filename to its object key under this destination's prefix.
    fn object_key(&self, filename: &str) -> String {
        format!("{}{}", self.prefix, filename)
    }
}

impl ChunkBackend for BucketChunkBackend {
    fn begin(
        &self,
        descriptor: &ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<BackendState, UploadError>> + Send + '_>> {
        let descriptor = descriptor.clone();
        Box::pin(async move {
            let key = self.object_key(&descriptor.filename);

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .content_type(&descriptor.mime_type_hint)
                .send()
                .await
                .map_err(|e| Self::sdk_failure("create_multipart_upload", e))?;

            let upload_id = resp
                .upload_id()
                .ok_or_else(|| UploadError::BackendFailure {
                    message: "S3 create_multipart_upload returned no upload id".to_string(),
                })?
                .to_string();

            debug!(
                "bucket begin: bucket={} key={} upload_id={}",
                self.bucket, key, upload_id
            );

            Self::encode_state(&BucketState {
                upload_id,
                key,
                parts: Vec::new(),
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
            validate_part_size(&descriptor, self.min_part_size)?;

            let mut bucket_state = Self::decode_state(&state)?;
            let part_number = bucket_state.parts.len() as u32 + 1;

            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&bucket_state.key)
                .upload_id(&bucket_state.upload_id)
                .part_number(part_number as i32)
                .body(aws_sdk_s3::primitives::ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::sdk_failure("upload_part", e))?;

            let etag = resp
                .e_tag()
                .ok_or_else(|| UploadError::BackendFailure {
                    message: "S3 upload_part returned no etag".to_string(),
                })?
                .to_string();

            debug!(
                "bucket append: key={} upload_id={} part={} len={}",
                bucket_state.key, bucket_state.upload_id, part_number, descriptor.chunk_length
            );

            bucket_state.parts.push((part_number, etag));
            Self::encode_state(&bucket_state)
        })
    }

    fn finalize(
        &self,
        state: BackendState,
        descriptor: &ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizedUpload, UploadError>> + Send + '_>> {
        let descriptor = descriptor.clone();
        Box::pin(async move {
            let bucket_state = Self::decode_state(&state)?;

            let completed_parts: Vec<CompletedPart> = bucket_state
                .parts
                .iter()
                .map(|(part_number, etag)| {
                    CompletedPart::builder()
                        .part_number(*part_number as i32)
                        .e_tag(etag)
                        .build()
                })
                .collect();

            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&bucket_state.key)
                .upload_id(&bucket_state.upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed_parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| Self::sdk_failure("complete_multipart_upload", e))?;

            let etag = resp.e_tag().unwrap_or("").to_string();

            debug!(
                "bucket finalize: key={} upload_id={} parts={}",
                bucket_state.key,
                bucket_state.upload_id,
                bucket_state.parts.len()
            );

            Ok(FinalizedUpload {
                destination: self.destination.clone(),
                location: bucket_state.key,
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
            let bucket_state = Self::decode_state(&state)?;

            debug!(
                "bucket abort: key={} upload_id={}",
                bucket_state.key, bucket_state.upload_id
            );

            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&bucket_state.key)
                .upload_id(&bucket_state.upload_id)
                .send()
                .await
            {
                // A missing upload means a previous abort already landed.
                let service_err = e.into_service_error();
                if service_err.is_no_such_upload() {
                    return Ok(());
                }
                warn!(
                    "failed to abort multipart upload {}: {}",
                    bucket_state.upload_id, service_err
                );
                return Err(Self::sdk_failure("abort_multipart_upload", service_err));
            }

            Ok(())
        })
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(offset: u64, len: u64, total: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            offset,
            chunk_length: len,
            total_length: total,
            filename: "big.dat".to_string(),
            mime_type_hint: "application/octet-stream".to_string(),
        }
    }

    const MIN: u64 = 5_000_000;

    #[test]
    fn test_non_terminal_part_must_meet_minimum() {
        // 2 MB chunk in the middle of a 12 MB upload.
        let err = validate_part_size(&descriptor(5_000_000, 2_000_000, 12_000_000), MIN)
            .unwrap_err();
        assert_eq!(err.code(), "ChunkTooSmall");
    }

    #[test]
    fn test_terminal_part_may_be_small() {
        // Final 2 MB chunk of a 12 MB upload.
        validate_part_size(&descriptor(10_000_000, 2_000_000, 12_000_000), MIN).unwrap();
    }

    #[test]
    fn test_exactly_minimum_is_accepted() {
        validate_part_size(&descriptor(0, MIN, 12_000_000), MIN).unwrap();
    }

    #[test]
    fn test_single_chunk_upload_is_terminal() {
        // A whole file below the minimum is one terminal chunk.
        validate_part_size(&descriptor(0, 100, 100), MIN).unwrap();
    }

    #[test]
    fn test_state_roundtrip() {
        let state = BucketState {
            upload_id: "u-123".to_string(),
            key: "uploads/big.dat".to_string(),
            parts: vec![(1, "\"aaa\"".to_string()), (2, "\"bbb\"".to_string())],
        };
        let blob = BucketChunkBackend::encode_state(&state).unwrap();
        let decoded = BucketChunkBackend::decode_state(&blob).unwrap();
        assert_eq!(decoded.upload_id, "u-123");
        assert_eq!(decoded.key, "uploads/big.dat");
        assert_eq!(decoded.parts.len(), 2);
        assert_eq!(decoded.parts[1], (2, "\"bbb\"".to_string()));
    }

    #[test]
    fn test_corrupt_state_is_backend_failure() {
        let err = BucketChunkBackend::decode_state(&serde_json::json!({"nope": true}))
            .unwrap_err();
        assert_eq!(err.code(), "BackendFailure");
    }
}
