//! SQLite-backed session store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required.  All async trait methods are thin wrappers around
//! synchronous rusqlite calls executed under a `Mutex`.  Sessions survive
//! process restarts, which is what makes chunked uploads resumable across
//! a redeploy.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::store::{FinalizedUpload, SessionStatus, SessionStore, UploadSession};

/// Session store backed by a single SQLite database file.
pub struct SqliteSessionStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required table and index if they do not already exist.
    /// Idempotent, safe to call on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS upload_sessions (
                session_id       TEXT PRIMARY KEY,
                destination      TEXT NOT NULL,
                filename         TEXT NOT NULL,
                total_length     INTEGER NOT NULL,
                bytes_received   INTEGER NOT NULL DEFAULT 0,
                backend_state    TEXT NOT NULL DEFAULT '{}',
                status           TEXT NOT NULL DEFAULT 'open',
                result           TEXT,
                created_at       TEXT NOT NULL,
                last_activity_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_last_activity
                ON upload_sessions(last_activity_at);
            ",
        )?;
        Ok(())
    }

    /// Map a database row to an [`UploadSession`].
    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
        Ok(RawSession {
            session_id: row.get(0)?,
            destination: row.get(1)?,
            filename: row.get(2)?,
            total_length: row.get::<_, i64>(3)? as u64,
            bytes_received: row.get::<_, i64>(4)? as u64,
            backend_state: row.get(5)?,
            status: row.get(6)?,
            result: row.get(7)?,
            created_at: row.get(8)?,
            last_activity_at: row.get(9)?,
        })
    }
}

/// Intermediate row shape before JSON/timestamp decoding.
struct RawSession {
    session_id: String,
    destination: String,
    filename: String,
    total_length: u64,
    bytes_received: u64,
    backend_state: String,
    status: String,
    result: Option<String>,
    created_at: String,
    last_activity_at: String,
}

impl RawSession {
    fn decode(self) -> anyhow::Result<UploadSession> {
        let result: Option<FinalizedUpload> = match self.result {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(UploadSession {
            session_id: self.session_id,
            destination: self.destination,
            filename: self.filename,
            total_length: self.total_length,
            bytes_received: self.bytes_received,
            backend_state: serde_json::from_str(&self.backend_state)?,
            status: SessionStatus::parse(&self.status)?,
            result,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc),
            last_activity_at: DateTime::parse_from_rfc3339(&self.last_activity_at)?
                .with_timezone(&Utc),
        })
    }
}

const SELECT_COLUMNS: &str = "session_id, destination, filename, total_length, bytes_received, \
                              backend_state, status, result, created_at, last_activity_at";

impl SessionStore for SqliteSessionStore {
    fn get(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadSession>>> + Send + '_>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM upload_sessions WHERE session_id = ?1"),
                    params![session_id],
                    Self::row_to_session,
                )
                .optional()?;
            raw.map(RawSession::decode).transpose()
        })
    }

    fn put(
        &self,
        session: UploadSession,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let backend_state = serde_json::to_string(&session.backend_state)?;
            let result = session
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO upload_sessions
                   (session_id, destination, filename, total_length, bytes_received,
                    backend_state, status, result, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(session_id) DO UPDATE SET
                   bytes_received   = excluded.bytes_received,
                   backend_state    = excluded.backend_state,
                   status           = excluded.status,
                   result           = excluded.result,
                   last_activity_at = excluded.last_activity_at",
                params![
                    session.session_id,
                    session.destination,
                    session.filename,
                    session.total_length as i64,
                    session.bytes_received as i64,
                    backend_state,
                    session.status.as_str(),
                    result,
                    session.created_at.to_rfc3339(),
                    session.last_activity_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn delete(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "DELETE FROM upload_sessions WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
    }

    fn list_idle(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<UploadSession>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM upload_sessions WHERE last_activity_at < ?1"
            ))?;
            let rows = stmt.query_map(params![cutoff.to_rfc3339()], Self::row_to_session)?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?.decode()?);
            }
            Ok(sessions)
        })
    }

    fn count_open(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM upload_sessions WHERE status = 'open'",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_store() -> SqliteSessionStore {
        SqliteSessionStore::new(":memory:").expect("failed to open in-memory db")
    }

    fn sample_session(id: &str, last_activity: DateTime<Utc>) -> UploadSession {
        UploadSession {
            session_id: id.to_string(),
            destination: "media".to_string(),
            filename: "a.bin".to_string(),
            total_length: 100,
            bytes_received: 40,
            backend_state: serde_json::json!({"upload_id": "u-1", "parts": [[1, "\"etag\""]]}),
            status: SessionStatus::Open,
            result: None,
            created_at: last_activity,
            last_activity_at: last_activity,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_all_fields() {
        let store = test_store();
        let session = sample_session("s1", Utc::now());
        store.put(session.clone()).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.destination, "media");
        assert_eq!(loaded.filename, "a.bin");
        assert_eq!(loaded.total_length, 100);
        assert_eq!(loaded.bytes_received, 40);
        assert_eq!(loaded.backend_state, session.backend_state);
        assert_eq!(loaded.status, SessionStatus::Open);
        assert!(loaded.result.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = test_store();
        assert!(store.get("no-such-session").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_updates_mutable_fields() {
        let store = test_store();
        let mut session = sample_session("s1", Utc::now());
        store.put(session.clone()).await.unwrap();

        session.bytes_received = 100;
        session.status = SessionStatus::Completed;
        session.result = Some(FinalizedUpload {
            destination: "media".to_string(),
            location: "/srv/media/a.bin".to_string(),
            total_length: 100,
            mime_type: "application/octet-stream".to_string(),
            etag: "\"abc\"".to_string(),
        });
        store.put(session).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.bytes_received, 100);
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.result.unwrap().location, "/srv/media/a.bin");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = test_store();
        store.put(sample_session("s1", Utc::now())).await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
        store.delete("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_idle_uses_rfc3339_ordering() {
        let store = test_store();
        let now = Utc::now();
        store
            .put(sample_session("old", now - Duration::hours(3)))
            .await
            .unwrap();
        store.put(sample_session("fresh", now)).await.unwrap();

        let idle = store.list_idle(now - Duration::hours(1)).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].session_id, "old");
    }

    #[tokio::test]
    async fn test_count_open() {
        let store = test_store();
        let now = Utc::now();
        store.put(sample_session("a", now)).await.unwrap();

        let mut aborted = sample_session("b", now);
        aborted.status = SessionStatus::Aborted;
        store.put(aborted).await.unwrap();

        assert_eq!(store.count_open().await.unwrap(), 1);
    }
}
