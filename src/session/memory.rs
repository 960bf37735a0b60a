//! In-memory session store.
//!
//! No persistence; sessions vanish on restart. Useful for tests and
//! ephemeral deployments. Uses `RwLock<HashMap>` for thread-safe access.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use super::store::{SessionStatus, SessionStore, UploadSession};

/// Session store backed by a process-local hash map.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadSession>>> + Send + '_>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let sessions = self.sessions.read().expect("rwlock poisoned");
            Ok(sessions.get(&session_id).cloned())
        })
    }

    fn put(
        &self,
        session: UploadSession,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().expect("rwlock poisoned");
            sessions.insert(session.session_id.clone(), session);
            Ok(())
        })
    }

    fn delete(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let mut sessions = self.sessions.write().expect("rwlock poisoned");
            sessions.remove(&session_id);
            Ok(())
        })
    }

    fn list_idle(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<UploadSession>>> + Send + '_>> {
        Box::pin(async move {
            let sessions = self.sessions.read().expect("rwlock poisoned");
            Ok(sessions
                .values()
                .filter(|s| s.last_activity_at < cutoff)
                .cloned()
                .collect())
        })
    }

    fn count_open(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let sessions = self.sessions.read().expect("rwlock poisoned");
            Ok(sessions
                .values()
                .filter(|s| s.status == SessionStatus::Open)
                .count() as u64)
        })
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::session_key;
    use chrono::Duration;

    fn sample_session(id: &str, last_activity: DateTime<Utc>) -> UploadSession {
        UploadSession {
            session_id: id.to_string(),
            destination: "media".to_string(),
            filename: "a.bin".to_string(),
            total_length: 100,
            bytes_received: 0,
            backend_state: serde_json::json!({"temp_path": "/tmp/x"}),
            status: SessionStatus::Open,
            result: None,
            created_at: last_activity,
            last_activity_at: last_activity,
        }
    }

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let store = MemorySessionStore::new();
        let id = session_key("media", "a.bin", 100);
        let session = sample_session(&id, Utc::now());

        store.put(session.clone()).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.bytes_received, 0);
        assert_eq!(loaded.backend_state, session.backend_state);

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        // Deleting again is fine.
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = MemorySessionStore::new();
        let mut session = sample_session("s1", Utc::now());
        store.put(session.clone()).await.unwrap();

        session.bytes_received = 50;
        store.put(session).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.bytes_received, 50);
    }

    #[tokio::test]
    async fn test_list_idle_filters_by_cutoff() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        store
            .put(sample_session("old", now - Duration::hours(2)))
            .await
            .unwrap();
        store.put(sample_session("fresh", now)).await.unwrap();

        let idle = store.list_idle(now - Duration::hours(1)).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].session_id, "old");
    }

    #[tokio::test]
    async fn test_count_open_excludes_terminal() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        store.put(sample_session("a", now)).await.unwrap();

        let mut done = sample_session("b", now);
        done.status = SessionStatus::Completed;
        store.put(done).await.unwrap();

        assert_eq!(store.count_open().await.unwrap(), 1);
    }
}
