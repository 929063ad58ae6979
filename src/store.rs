//! Durable record of session identity.
//!
//! Backed by `rusqlite` in WAL mode: single-writer/multi-reader, crash safe,
//! readers never block writers. Contention ("database is locked") is
//! retried internally with exponential backoff; callers never see it.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandkastenError};

const BUSY_RETRY_ATTEMPTS: u32 = 4;
const BUSY_RETRY_BASE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    PoolIdle,
    Destroying,
    Destroyed,
    Expired,
    Crashed,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::PoolIdle => "pool_idle",
            SessionStatus::Destroying => "destroying",
            SessionStatus::Destroyed => "destroyed",
            SessionStatus::Expired => "expired",
            SessionStatus::Crashed => "crashed",
        }
    }

    fn from_str(s: &str) -> Option<SessionStatus> {
        Some(match s {
            "running" => SessionStatus::Running,
            "pool_idle" => SessionStatus::PoolIdle,
            "destroying" => SessionStatus::Destroying,
            "destroyed" => SessionStatus::Destroyed,
            "expired" => SessionStatus::Expired,
            "crashed" => SessionStatus::Crashed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub image: String,
    pub init_pid: i32,
    pub cgroup_path: String,
    pub status: SessionStatus,
    pub cwd: String,
    pub workspace_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Single-table session Store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 0)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                image TEXT NOT NULL,
                init_pid INTEGER NOT NULL,
                cgroup_path TEXT NOT NULL,
                status TEXT NOT NULL,
                cwd TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                last_activity TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);",
        )?;
        Ok(())
    }

    /// Retries a write closure on SQLITE_BUSY with exponential backoff,
    /// starting at 25ms, up to 4 attempts.
    fn with_retry<T>(&self, mut f: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        let mut delay = BUSY_RETRY_BASE;
        for attempt in 0..=BUSY_RETRY_ATTEMPTS {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy
                        && attempt < BUSY_RETRY_ATTEMPTS =>
                {
                    std::thread::sleep(delay);
                    delay *= 2;
                    continue;
                }
                Err(e) => return Err(SandkastenError::from(e)),
            }
        }
        unreachable!("loop always returns or errors")
    }

    pub fn create_session(&self, record: &SessionRecord) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO sessions
                    (id, image, init_pid, cgroup_path, status, cwd, workspace_id,
                     created_at, expires_at, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.image,
                    record.init_pid,
                    record.cgroup_path,
                    record.status.as_str(),
                    record.cwd,
                    record.workspace_id,
                    record.created_at.to_rfc3339(),
                    record.expires_at.to_rfc3339(),
                    record.last_activity.to_rfc3339(),
                ],
            )
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT id, image, init_pid, cgroup_path, status, cwd, workspace_id,
                        created_at, expires_at, last_activity
                 FROM sessions WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()
        })
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image, init_pid, cgroup_path, status, cwd, workspace_id,
                        created_at, expires_at, last_activity
                 FROM sessions ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect()
        })
    }

    pub fn update_session_activity(
        &self,
        id: &str,
        cwd: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.with_retry(|conn| {
            conn.execute(
                "UPDATE sessions SET cwd = ?2, last_activity = ?3, expires_at = ?4 WHERE id = ?1",
                params![id, cwd, Utc::now().to_rfc3339(), expires_at.to_rfc3339()],
            )
        })?;
        if affected == 0 {
            return Err(SandkastenError::NotFound);
        }
        Ok(())
    }

    pub fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let affected = self.with_retry(|conn| {
            conn.execute(
                "UPDATE sessions SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
        })?;
        if affected == 0 {
            return Err(SandkastenError::NotFound);
        }
        Ok(())
    }

    pub fn update_session_workspace(&self, id: &str, workspace_id: &str) -> Result<()> {
        let affected = self.with_retry(|conn| {
            conn.execute(
                "UPDATE sessions SET workspace_id = ?2 WHERE id = ?1",
                params![id, workspace_id],
            )
        })?;
        if affected == 0 {
            return Err(SandkastenError::NotFound);
        }
        Ok(())
    }

    pub fn list_expired_sessions(&self) -> Result<Vec<SessionRecord>> {
        let now = Utc::now().to_rfc3339();
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image, init_pid, cgroup_path, status, cwd, workspace_id,
                        created_at, expires_at, last_activity
                 FROM sessions WHERE status = 'running' AND expires_at <= ?1",
            )?;
            let rows = stmt.query_map(params![now], row_to_record)?;
            rows.collect()
        })
    }

    pub fn list_running_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image, init_pid, cgroup_path, status, cwd, workspace_id,
                        created_at, expires_at, last_activity
                 FROM sessions WHERE status = 'running'",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect()
        })
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        let affected = self.with_retry(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])
        })?;
        if affected == 0 {
            return Err(SandkastenError::NotFound);
        }
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status_str: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let expires_at: String = row.get(8)?;
    let last_activity: String = row.get(9)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        image: row.get(1)?,
        init_pid: row.get(2)?,
        cgroup_path: row.get(3)?,
        status: SessionStatus::from_str(&status_str).unwrap_or(SessionStatus::Crashed),
        cwd: row.get(5)?,
        workspace_id: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .unwrap()
            .with_timezone(&Utc),
        last_activity: DateTime::parse_from_rfc3339(&last_activity)
            .unwrap()
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_record(id: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: id.to_string(),
            image: "base".to_string(),
            init_pid: 1234,
            cgroup_path: format!("/sys/fs/cgroup/sandkasten/{id}"),
            status: SessionStatus::Running,
            cwd: "/workspace".to_string(),
            workspace_id: String::new(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(1800),
            last_activity: now,
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let record = sample_record("a1b2c3d4-e5f");
        store.create_session(&record).unwrap();
        let fetched = store.get_session(&record.id).unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.status, SessionStatus::Running);
    }

    #[test]
    fn create_fails_on_duplicate_id() {
        let store = Store::open_in_memory().unwrap();
        let record = sample_record("dup-id");
        store.create_session(&record).unwrap();
        assert!(store.create_session(&record).is_err());
    }

    #[test]
    fn get_missing_returns_none_not_error() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_session("nope").unwrap().is_none());
    }

    #[test]
    fn update_activity_extends_lease_and_sets_cwd() {
        let store = Store::open_in_memory().unwrap();
        let record = sample_record("sess-1");
        store.create_session(&record).unwrap();
        let new_expiry = Utc::now() + ChronoDuration::seconds(3600);
        store
            .update_session_activity("sess-1", "/workspace/sub", new_expiry)
            .unwrap();
        let fetched = store.get_session("sess-1").unwrap().unwrap();
        assert_eq!(fetched.cwd, "/workspace/sub");
    }

    #[test]
    fn update_activity_on_missing_session_fails() {
        let store = Store::open_in_memory().unwrap();
        assert!(store
            .update_session_activity("ghost", "/", Utc::now())
            .is_err());
    }

    #[test]
    fn list_expired_sessions_only_returns_running_and_past_ttl() {
        let store = Store::open_in_memory().unwrap();
        let mut expired = sample_record("expired-1");
        expired.expires_at = Utc::now() - ChronoDuration::seconds(5);
        store.create_session(&expired).unwrap();

        let mut fresh = sample_record("fresh-1");
        fresh.expires_at = Utc::now() + ChronoDuration::seconds(3600);
        store.create_session(&fresh).unwrap();

        let mut idle = sample_record("idle-1");
        idle.status = SessionStatus::PoolIdle;
        idle.expires_at = Utc::now() - ChronoDuration::seconds(5);
        store.create_session(&idle).unwrap();

        let results = store.list_expired_sessions().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "expired-1");
    }

    #[test]
    fn delete_is_not_idempotent_at_store_layer() {
        let store = Store::open_in_memory().unwrap();
        let record = sample_record("to-delete");
        store.create_session(&record).unwrap();
        store.delete_session("to-delete").unwrap();
        assert!(store.delete_session("to-delete").is_err());
    }

    #[test]
    fn list_sessions_orders_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let mut first = sample_record("first");
        first.created_at = Utc::now() - ChronoDuration::seconds(10);
        store.create_session(&first).unwrap();
        let second = sample_record("second");
        store.create_session(&second).unwrap();

        let all = store.list_sessions().unwrap();
        assert_eq!(all[0].id, "second");
    }
}
