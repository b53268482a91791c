use rollcall_core::StoreError;
use rusqlite::ErrorCode;
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS reference_embeddings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id   TEXT NOT NULL,
    embedding     TEXT NOT NULL,
    model_version TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reference_identity ON reference_embeddings(identity_id);

CREATE TABLE IF NOT EXISTS attendance (
    id              TEXT PRIMARY KEY,
    identity_id     TEXT NOT NULL,
    day             TEXT NOT NULL,
    subject_context TEXT,
    status          TEXT NOT NULL,
    confidence      REAL NOT NULL,
    marked_at       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_unique
    ON attendance(identity_id, day, COALESCE(subject_context, ''));

CREATE TABLE IF NOT EXISTS audit_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id     TEXT,
    reason          TEXT NOT NULL,
    liveness_score  REAL,
    subject_context TEXT,
    detail          TEXT,
    created_at      TEXT NOT NULL
);
";

/// SQLite database holding references, attendance and the audit log.
///
/// All statements run on tokio-rusqlite's connection thread. Implements
/// every `rollcall-core` store trait.
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).await.map_err(map_err)?;
        let db = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(db)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(map_err)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            c.busy_timeout(BUSY_TIMEOUT)?;
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(map_err)?;
        Ok(Self { conn })
    }
}

/// Classify a database error for the pipeline's retry and conflict logic.
pub(crate) fn map_err(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => map_sqlite(e),
        tokio_rusqlite::Error::ConnectionClosed => {
            StoreError::Backend("database connection closed".into())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn map_sqlite(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Conflict,
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            StoreError::Transient(e.to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        db.conn
            .call(|c| {
                c.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_parent_dir() {
        let dir = std::env::temp_dir().join(format!("rollcall-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("rollcall.db");
        Database::open(&path).await.unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(map_sqlite(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(matches!(map_sqlite(constraint), StoreError::Conflict));
    }
}
