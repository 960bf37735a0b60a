//! Upload coordinator: the chunked-upload protocol state machine.
//!
//! The coordinator owns all protocol logic: it identifies or creates the
//! session for an incoming chunk, validates ordering and overlap, decides
//! pending vs. complete, and drives the selected backend.  States:
//! `NoSession -> Open -> {Completed, Aborted}`; only Open accepts further
//! chunks.
//!
//! Steps 1-6 of [`UploadCoordinator::submit`] execute as a single critical
//! section per session id: two chunks for the same upload arriving
//! concurrently must not both observe the same `bytes_received` and both
//! believe they are the next chunk.  Lock granularity is per-session,
//! never global, so unrelated uploads proceed fully in parallel.

use bytes::Bytes;
use chrono::{Duration, Utc};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::errors::UploadError;
use crate::range::ChunkDescriptor;
use crate::session::store::{
    session_key, FinalizedUpload, SessionStatus, SessionStore, UploadSession,
};
use crate::storage::backend::ChunkBackend;
use crate::storage::BackendSelector;

/// Outcome of a single chunk submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The chunk was accepted; more bytes are expected.
    Pending {
        bytes_received: u64,
        total_length: u64,
    },
    /// All bytes arrived and the upload was finalized.
    Complete(FinalizedUpload),
}

/// Point-in-time view of a session, for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub bytes_received: u64,
    pub total_length: u64,
    pub result: Option<FinalizedUpload>,
}

/// Per-session lock registry.
///
/// Entries are created on demand and discarded only when provably unused,
/// so a waiter blocked on an old lock can never race a fresh lock for the
/// same session id.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("mutex poisoned");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the registry entry if no other task holds or awaits the lock.
    /// `held` is the caller's own clone.
    fn discard_if_unused(&self, session_id: &str, held: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().expect("mutex poisoned");
        // Two strong refs: the map's and the caller's. Anything more means
        // another task is interested.
        if Arc::strong_count(held) == 2 {
            locks.remove(session_id);
        }
    }
}

/// Drives chunk submissions through the session store and backends.
pub struct UploadCoordinator {
    store: Arc<dyn SessionStore>,
    selector: BackendSelector,
    locks: SessionLocks,
    /// Bound on any single backend call.
    backend_timeout: std::time::Duration,
    /// Sessions idle longer than this are swept.
    idle_timeout: Duration,
    /// Maximum declared total size accepted.
    max_upload_size: u64,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        selector: BackendSelector,
        backend_timeout: std::time::Duration,
        idle_timeout: std::time::Duration,
        max_upload_size: u64,
    ) -> Self {
        Self {
            store,
            selector,
            locks: SessionLocks::default(),
            backend_timeout,
            idle_timeout: Duration::from_std(idle_timeout).unwrap_or_else(|_| Duration::hours(1)),
            max_upload_size,
        }
    }

    /// Run a backend call under the configured bound.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, UploadError>>,
    ) -> Result<T, UploadError> {
        match tokio::time::timeout(self.backend_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::BackendTimeout),
        }
    }

    fn backend_for(&self, destination: &str) -> Result<Arc<dyn ChunkBackend>, UploadError> {
        self.selector
            .select(destination)
            .ok_or_else(|| UploadError::UnknownDestination {
                name: destination.to_string(),
            })
    }

    /// Submit one chunk for the logical upload identified by
    /// `(destination, descriptor.filename, descriptor.total_length)`.
    pub async fn submit(
        &self,
        destination: &str,
        descriptor: &ChunkDescriptor,
        data: Bytes,
    ) -> Result<SubmitOutcome, UploadError> {
        if descriptor.total_length > self.max_upload_size {
            return Err(UploadError::EntityTooLarge {
                total_length: descriptor.total_length,
                max_upload_size: self.max_upload_size,
            });
        }
        if data.len() as u64 != descriptor.chunk_length {
            return Err(UploadError::MalformedRange {
                message: format!(
                    "body is {} bytes but Content-Range declares {}",
                    data.len(),
                    descriptor.chunk_length
                ),
            });
        }

        let backend = self.backend_for(destination)?;
        let session_id = session_key(destination, &descriptor.filename, descriptor.total_length);

        // Critical section: everything from the session read to the final
        // persist happens under this session's lock.
        let lock = self.locks.lock_for(&session_id);
        let _guard = lock.lock().await;

        let existing = self.store.get(&session_id).await?;

        let mut session = match existing {
            Some(session) if session.status == SessionStatus::Completed => {
                // Idempotent replay of an already-received chunk.
                if descriptor.offset + descriptor.chunk_length <= session.bytes_received {
                    let result = session.result.clone().ok_or_else(|| {
                        anyhow::anyhow!("completed session {session_id} has no stored result")
                    })?;
                    return Ok(SubmitOutcome::Complete(result));
                }
                return Err(UploadError::StaleSession { session_id });
            }
            Some(session) if session.status == SessionStatus::Aborted => {
                // An aborted key restarts as a new logical upload. The
                // inline abort may have failed; retry the backend release
                // before dropping the tombstone.
                self.release_backend(&session, &backend).await;
                self.store.delete(&session_id).await?;
                debug!("session {session_id}: replacing aborted session");
                self.create_session(&session_id, destination, descriptor, &backend)
                    .await?
            }
            Some(session) => session,
            None => {
                self.create_session(&session_id, destination, descriptor, &backend)
                    .await?
            }
        };

        // Idempotent no-op: the chunk is already fully covered.
        if descriptor.offset + descriptor.chunk_length <= session.bytes_received {
            if session.bytes_received == session.total_length {
                // A previous finalize failed after all bytes landed; the
                // retry of the final chunk re-triggers it.
                return self.finalize_session(&mut session, descriptor, &backend).await;
            }
            counter!(crate::metrics::CHUNKS_REPLAYED_TOTAL).increment(1);
            return Ok(SubmitOutcome::Pending {
                bytes_received: session.bytes_received,
                total_length: session.total_length,
            });
        }

        // Strictly sequential chunks only; the multipart backend cannot
        // rewrite arbitrary offsets, so the contract is uniform.
        if descriptor.offset != session.bytes_received {
            return Err(UploadError::OutOfOrderChunk {
                offset: descriptor.offset,
                bytes_received: session.bytes_received,
            });
        }

        // Persist the payload.
        let new_state = match self
            .bounded(backend.append_chunk(session.backend_state.clone(), descriptor, data))
            .await
        {
            Ok(state) => state,
            Err(UploadError::BackendTimeout) => {
                // No session mutation: the chunk is retryable as-is.
                return Err(UploadError::BackendTimeout);
            }
            Err(err) => {
                // Unrecoverable for this session: release backend state and
                // mark the session aborted so the key restarts fresh.
                self.abort_session(&mut session, &backend).await;
                return Err(err);
            }
        };

        session.backend_state = new_state;
        session.bytes_received += descriptor.chunk_length;
        session.last_activity_at = Utc::now();
        self.store.put(session.clone()).await?;

        counter!(crate::metrics::CHUNKS_RECEIVED_TOTAL).increment(1);
        counter!(crate::metrics::BYTES_RECEIVED_TOTAL).increment(descriptor.chunk_length);

        if session.bytes_received == session.total_length {
            return self.finalize_session(&mut session, descriptor, &backend).await;
        }

        Ok(SubmitOutcome::Pending {
            bytes_received: session.bytes_received,
            total_length: session.total_length,
        })
    }

    /// Create and persist a fresh Open session, initializing the backend.
    async fn create_session(
        &self,
        session_id: &str,
        destination: &str,
        descriptor: &ChunkDescriptor,
        backend: &Arc<dyn ChunkBackend>,
    ) -> Result<UploadSession, UploadError> {
        let backend_state = self.bounded(backend.begin(descriptor)).await?;
        let now = Utc::now();
        let session = UploadSession {
            session_id: session_id.to_string(),
            destination: destination.to_string(),
            filename: descriptor.filename.clone(),
            total_length: descriptor.total_length,
            bytes_received: 0,
            backend_state,
            status: SessionStatus::Open,
            result: None,
            created_at: now,
            last_activity_at: now,
        };
        self.store.put(session.clone()).await?;
        info!(
            "session {session_id}: opened for '{}' ({} bytes) at destination '{destination}'",
            descriptor.filename, descriptor.total_length
        );
        Ok(session)
    }

    /// All bytes arrived: drive the backend finalize and settle the session.
    ///
    /// A finalize failure leaves the session Open so a retry of the final
    /// chunk re-triggers it without re-uploading earlier data.
    async fn finalize_session(
        &self,
        session: &mut UploadSession,
        descriptor: &ChunkDescriptor,
        backend: &Arc<dyn ChunkBackend>,
    ) -> Result<SubmitOutcome, UploadError> {
        let result = self
            .bounded(backend.finalize(session.backend_state.clone(), descriptor))
            .await?;

        session.status = SessionStatus::Completed;
        session.result = Some(result.clone());
        session.last_activity_at = Utc::now();
        self.store.put(session.clone()).await?;

        counter!(crate::metrics::UPLOADS_COMPLETED_TOTAL).increment(1);
        info!(
            "session {}: completed, {} bytes at {}",
            session.session_id, result.total_length, result.location
        );

        Ok(SubmitOutcome::Complete(result))
    }

    /// Release a session's backend state, best-effort. A failure here is
    /// retried later: on the idle sweep, or when the key restarts.
    async fn release_backend(&self, session: &UploadSession, backend: &Arc<dyn ChunkBackend>) {
        if let Err(e) = self
            .bounded(backend.abort(session.backend_state.clone()))
            .await
        {
            warn!(
                "session {}: best-effort backend abort failed: {e}",
                session.session_id
            );
        }
    }

    /// Mark a session aborted and release its backend state, best-effort.
    async fn abort_session(&self, session: &mut UploadSession, backend: &Arc<dyn ChunkBackend>) {
        self.release_backend(session, backend).await;

        session.status = SessionStatus::Aborted;
        session.last_activity_at = Utc::now();
        if let Err(e) = self.store.put(session.clone()).await {
            warn!(
                "session {}: failed to persist aborted status: {e}",
                session.session_id
            );
        }
        counter!(crate::metrics::UPLOADS_ABORTED_TOTAL).increment(1);
    }

    /// Look up the current state of a logical upload.
    pub async fn status(
        &self,
        destination: &str,
        filename: &str,
        total_length: u64,
    ) -> Result<Option<SessionSummary>, UploadError> {
        let session_id = session_key(destination, filename, total_length);
        let session = self.store.get(&session_id).await?;
        Ok(session.map(|s| SessionSummary {
            session_id: s.session_id,
            status: s.status,
            bytes_received: s.bytes_received,
            total_length: s.total_length,
            result: s.result,
        }))
    }

    /// Explicitly cancel a logical upload: abort backend state and remove
    /// the session. Returns whether a session existed.
    pub async fn cancel(
        &self,
        destination: &str,
        filename: &str,
        total_length: u64,
    ) -> Result<bool, UploadError> {
        let session_id = session_key(destination, filename, total_length);

        let lock = self.locks.lock_for(&session_id);
        let guard = lock.lock().await;

        let Some(mut session) = self.store.get(&session_id).await? else {
            drop(guard);
            self.locks.discard_if_unused(&session_id, &lock);
            return Ok(false);
        };

        if session.status == SessionStatus::Open {
            let backend = self.backend_for(destination)?;
            self.abort_session(&mut session, &backend).await;
        }
        self.store.delete(&session_id).await?;

        drop(guard);
        self.locks.discard_if_unused(&session_id, &lock);
        info!("session {session_id}: cancelled by client");
        Ok(true)
    }

    /// Remove sessions idle past the configured threshold, aborting their
    /// backend state. This is the only path that deletes sessions without
    /// a triggering client request; it takes the per-session lock so it
    /// cannot race a just-arrived chunk. Returns the number removed.
    pub async fn sweep_idle(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - self.idle_timeout;
        let idle = self.store.list_idle(cutoff).await?;
        let mut removed = 0u64;

        for stale in idle {
            let lock = self.locks.lock_for(&stale.session_id);
            let guard = lock.lock().await;

            // Re-check under the lock; a chunk may have just arrived.
            let Some(session) = self.store.get(&stale.session_id).await? else {
                drop(guard);
                self.locks.discard_if_unused(&stale.session_id, &lock);
                continue;
            };
            if session.last_activity_at >= cutoff {
                drop(guard);
                self.locks.discard_if_unused(&stale.session_id, &lock);
                continue;
            }

            // Open sessions carry live backend state; Aborted tombstones may
            // too, if their inline abort failed. Retry the release for both
            // before deleting. Completed sessions have nothing to release.
            if session.status != SessionStatus::Completed {
                match self.backend_for(&session.destination) {
                    Ok(backend) => {
                        self.release_backend(&session, &backend).await;
                        if session.status == SessionStatus::Open {
                            counter!(crate::metrics::UPLOADS_ABORTED_TOTAL).increment(1);
                        }
                    }
                    Err(_) => warn!(
                        "session {}: destination '{}' no longer configured, skipping backend abort",
                        session.session_id, session.destination
                    ),
                }
            }

            self.store.delete(&session.session_id).await?;
            removed += 1;
            debug!("session {}: swept after idle timeout", session.session_id);

            drop(guard);
            self.locks.discard_if_unused(&stale.session_id, &lock);
        }

        if removed > 0 {
            counter!(crate::metrics::SESSIONS_SWEPT_TOTAL).increment(removed);
            info!("idle sweep removed {removed} session(s)");
        }
        if let Ok(open) = self.store.count_open().await {
            gauge!(crate::metrics::SESSIONS_OPEN).set(open as f64);
        }

        Ok(removed)
    }
}

// -- Tests --------------------------------------------------------------------
