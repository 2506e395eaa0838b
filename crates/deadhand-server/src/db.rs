//! SQLite persistence layer.
//!
//! Everything the service owns is stored as JSON bodies in one `records`
//! table keyed by `(kind, id)`, so each record type gets a
//! [`SqliteRepository`] without its own schema. The audit chain has a
//! dedicated append-only table.

use chrono::{DateTime, Utc};
use deadhand_audit::AuditEntry;
use deadhand_core::{Repository, RepositoryError};
use rusqlite::{params, Connection, Result as SqlResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Record kinds stored in the `records` table.
pub const PRINCIPALS: &str = "principal";
pub const HEARTBEATS: &str = "heartbeat";
pub const CASES: &str = "case";
pub const QUORUM: &str = "quorum";
pub const HANDLES: &str = "secret_handle";

/// Open (or create) the database at `path` and run migrations.
pub fn open_db(path: &Path) -> SqlResult<Connection> {
    let conn = Connection::open(path)?;

    // WAL mode for better concurrent read performance
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS records (
            kind       TEXT NOT NULL,
            id         TEXT NOT NULL,
            body       TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (kind, id)
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            sequence    INTEGER PRIMARY KEY,
            recorded_at TEXT NOT NULL,
            payload     TEXT NOT NULL,
            prev_hash   TEXT NOT NULL,
            hash        TEXT NOT NULL
        );
        ",
    )?;

    Ok(conn)
}

/// Shared handle to the open database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> SqlResult<Self> {
        Ok(Self {
            conn: Mutex::new(open_db(path)?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
        self.conn.lock().map_err(|_| RepositoryError::Poisoned)
    }

    // ========================================================================
    // Records
    // ========================================================================

    fn record_get(&self, kind: &str, id: &str) -> Result<Option<String>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT body FROM records WHERE kind = ?1 AND id = ?2")
            .map_err(backend)?;
        let mut rows = stmt.query(params![kind, id]).map_err(backend)?;
        match rows.next().map_err(backend)? {
            Some(row) => Ok(Some(row.get(0).map_err(backend)?)),
            None => Ok(None),
        }
    }

    fn record_set(&self, kind: &str, id: &str, body: &str) -> Result<(), RepositoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO records (kind, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![kind, id, body, Utc::now().to_rfc3339()],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn record_ids(&self, kind: &str) -> Result<Vec<String>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT id FROM records WHERE kind = ?1 ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![kind], |row| row.get(0))
            .map_err(backend)?;
        rows.collect::<SqlResult<Vec<String>>>().map_err(backend)
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    /// Every persisted audit entry, oldest first.
    pub fn load_audit(&self) -> Result<Vec<AuditEntry>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT sequence, recorded_at, payload, prev_hash, hash
                 FROM audit_log ORDER BY sequence",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(backend)?;

        let mut entries = Vec::new();
        for row in rows {
            let (sequence, recorded_at, payload, prev_hash, hash) = row.map_err(backend)?;
            let corrupt = |reason: String| RepositoryError::Corrupt {
                id: format!("audit/{}", sequence),
                reason,
            };
            entries.push(AuditEntry {
                sequence: u64::try_from(sequence).map_err(|e| corrupt(e.to_string()))?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map_err(|e| corrupt(e.to_string()))?
                    .with_timezone(&Utc),
                payload: serde_json::from_str(&payload).map_err(|e| corrupt(e.to_string()))?,
                prev_hash,
                hash,
            });
        }
        Ok(entries)
    }

    /// Highest persisted sequence number, 0 when the log is empty.
    pub fn last_audit_sequence(&self) -> Result<u64, RepositoryError> {
        let conn = self.conn()?;
        let last: Option<i64> = conn
            .query_row("SELECT MAX(sequence) FROM audit_log", [], |row| row.get(0))
            .map_err(backend)?;
        Ok(last.and_then(|s| u64::try_from(s).ok()).unwrap_or(0))
    }

    /// Append entries in one transaction. Existing sequence numbers are
    /// never overwritten.
    pub fn append_audit(&self, entries: &[AuditEntry]) -> Result<usize, RepositoryError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO audit_log (sequence, recorded_at, payload, prev_hash, hash)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(backend)?;
            for entry in entries {
                let sequence = i64::try_from(entry.sequence).map_err(|e| RepositoryError::Corrupt {
                    id: format!("audit/{}", entry.sequence),
                    reason: e.to_string(),
                })?;
                stmt.execute(params![
                    sequence,
                    entry.recorded_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                    entry.payload.to_string(),
                    entry.prev_hash,
                    entry.hash,
                ])
                .map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)?;
        Ok(entries.len())
    }
}

fn backend(e: rusqlite::Error) -> RepositoryError {
    RepositoryError::Backend(e.to_string())
}

// ============================================================================
// Repository adapter
// ============================================================================

/// `Repository<T>` over one record kind.
pub struct SqliteRepository<T> {
    db: Arc<Database>,
    kind: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SqliteRepository<T> {
    pub fn new(db: Arc<Database>, kind: &'static str) -> Self {
        Self {
            db,
            kind,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Repository<T> for SqliteRepository<T> {
    fn load(&self, id: &str) -> Result<Option<T>, RepositoryError> {
        match self.db.record_get(self.kind, id)? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| RepositoryError::Corrupt {
                    id: format!("{}/{}", self.kind, id),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn save(&self, id: &str, value: &T) -> Result<(), RepositoryError> {
        let body = serde_json::to_string(value).map_err(|e| RepositoryError::Corrupt {
            id: format!("{}/{}", self.kind, id),
            reason: e.to_string(),
        })?;
        self.db.record_set(self.kind, id, &body)
    }

    fn ids(&self) -> Result<Vec<String>, RepositoryError> {
        self.db.record_ids(self.kind)
    }
}

// ============================================================================
// Tests
// ============================================================================
