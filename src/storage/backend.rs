//! Abstract chunk persistence trait.
//!
//! Every storage backend must implement [`ChunkBackend`].  The coordinator
//! is written once against this trait and stays backend-agnostic: the two
//! materially different persistence strategies (local offset-writes vs.
//! remote append-once multipart parts) hide behind the same four
//! operations.
//!
//! Backends communicate progress through an opaque JSON `BackendState`
//! blob.  The coordinator stores it verbatim in the session record and
//! passes it back on the next call; it never inspects the contents.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

use crate::errors::UploadError;
use crate::range::ChunkDescriptor;
use crate::session::store::FinalizedUpload;

/// Opaque backend continuation token, owned by the backend that minted it.
pub type BackendState = serde_json::Value;

/// Async chunk persistence contract.
///
/// All errors are expressed in the crate-wide [`UploadError`] taxonomy;
/// IO and SDK error types never cross this boundary.
pub trait ChunkBackend: Send + Sync + 'static {
    /// Initialize persistence for a new logical upload and return the
    /// initial backend state.
    fn begin(
        &self,
        descriptor: &ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<BackendState, UploadError>> + Send + '_>>;

    /// Persist one chunk and return the advanced backend state.
    ///
    /// The coordinator guarantees chunks arrive strictly in order, so a
    /// backend may treat each call as "the next" write.
    fn append_chunk(
        &self,
        state: BackendState,
        descriptor: &ChunkDescriptor,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<BackendState, UploadError>> + Send + '_>>;

    /// Make the fully received upload durable at its destination.
    ///
    /// Must be idempotent given unchanged backend state: a finalize that
    /// failed after the bytes were appended is retried by re-submitting
    /// the final chunk.
    fn finalize(
        &self,
        state: BackendState,
        descriptor: &ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizedUpload, UploadError>> + Send + '_>>;

    /// Release any partial state held by the backend. Best-effort and
    /// idempotent; called on unrecoverable errors and by the idle sweep.
    fn abort(
        &self,
        state: BackendState,
    ) -> Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + '_>>;
}
