//! Abstract session store trait.
//!
//! The session store is the single source of truth for in-progress uploads:
//! backends receive only the opaque `backend_state` blob and must not keep
//! an independent copy.  The trait uses manual desugaring with pinned
//! futures so it can back both the in-memory and SQLite implementations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;

/// Derive the deterministic session key for a logical upload.
///
/// Repeated requests for the same `(destination, filename, total_length)`
/// collide into one session instead of creating duplicates. Fields are
/// length-prefixed before hashing so no two distinct triples can produce
/// the same byte stream.
pub fn session_key(destination: &str, filename: &str, total_length: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update((destination.len() as u64).to_be_bytes());
    hasher.update(destination.as_bytes());
    hasher.update((filename.len() as u64).to_be_bytes());
    hasher.update(filename.as_bytes());
    hasher.update(total_length.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting chunks.
    Open,
    /// Finalized successfully; terminal.
    Completed,
    /// Abandoned or failed; terminal.
    Aborted,
}

impl SessionStatus {
    /// Stable string form used by the SQLite store.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        }
    }

    /// Parse the string form written by [`SessionStatus::as_str`].
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "open" => Ok(SessionStatus::Open),
            "completed" => Ok(SessionStatus::Completed),
            "aborted" => Ok(SessionStatus::Aborted),
            other => anyhow::bail!("unknown session status: {other}"),
        }
    }
}

/// The result handed to the caller once an upload completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedUpload {
    /// Destination name the upload landed in.
    pub destination: String,
    /// Final path (local backend) or object key (bucket backend).
    pub location: String,
    /// Total size in bytes.
    pub total_length: u64,
    /// Content type declared by the client.
    pub mime_type: String,
    /// Backend ETag of the finalized object, if any.
    pub etag: String,
}

/// Durable record of an in-progress upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Deterministic key, see [`session_key`].
    pub session_id: String,
    /// Destination name.
    pub destination: String,
    /// Filename declared by the client.
    pub filename: String,
    /// Declared total size in bytes.
    pub total_length: u64,
    /// Bytes accepted so far; monotonically non-decreasing while Open.
    pub bytes_received: u64,
    /// Opaque blob owned by the backend (temp-file path, multipart upload
    /// id + part list).  Never interpreted by the coordinator or the store.
    pub backend_state: serde_json::Value,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Completion result, persisted so retries of the final chunk can
    /// replay it.
    pub result: Option<FinalizedUpload>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last accepted chunk; drives the idle sweep.
    pub last_activity_at: DateTime<Utc>,
}

/// Async session store contract.
pub trait SessionStore: Send + Sync + 'static {
    /// Get a session by id.
    fn get(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadSession>>> + Send + '_>>;

    /// Insert or update a session (upsert).
    fn put(
        &self,
        session: UploadSession,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Delete a session by id. Idempotent.
    fn delete(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List sessions whose `last_activity_at` precedes `cutoff`, regardless
    /// of status. Used by the idle sweep.
    fn list_idle(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<UploadSession>>> + Send + '_>>;

    /// Count sessions currently in the Open state.
    fn count_open(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_is_deterministic() {
        let a = session_key("media", "photo.jpg", 1000);
        let b = session_key("media", "photo.jpg", 1000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_session_key_distinguishes_all_components() {
        let base = session_key("media", "photo.jpg", 1000);
        assert_ne!(base, session_key("archive", "photo.jpg", 1000));
        assert_ne!(base, session_key("media", "photo2.jpg", 1000));
        assert_ne!(base, session_key("media", "photo.jpg", 1001));
    }

    #[test]
    fn test_session_key_length_prefix_prevents_concatenation_collisions() {
        // Without length prefixes "ab" + "c" and "a" + "bc" would hash alike.
        assert_ne!(session_key("ab", "c", 1), session_key("a", "bc", 1));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Open,
            SessionStatus::Completed,
            SessionStatus::Aborted,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SessionStatus::parse("bogus").is_err());
    }
}
