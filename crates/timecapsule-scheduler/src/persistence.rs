//! SQLite-backed capsule store — survives restarts.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that
//! `ORDER BY scheduled_at` sorts chronologically. Attachments live in a JSON
//! column; they are never queried individually.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use timecapsule_core::error::{CapsuleError, Result};
use timecapsule_core::{Capsule, CapsulePatch, CapsuleStatus, CapsuleStore};

const CAPSULE_COLUMNS: &str = "id, recipient, subject, message, scheduled_at, status, created_at, \
     updated_at, delivered_at, last_error, attachments";

/// SQLite persistence for capsules.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open or create the capsule database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(|e| store_err("DB open", e))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| store_err("DB open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS capsules (
                id TEXT PRIMARY KEY,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                message TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, sending, sent, failed
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                delivered_at TEXT,
                last_error TEXT,
                attachments TEXT NOT NULL DEFAULT '[]'   -- JSON array of descriptors
            );

            CREATE INDEX IF NOT EXISTS idx_capsules_due ON capsules (status, scheduled_at);
         ",
            )
            .map_err(|e| store_err("Migration", e))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select_one(conn: &rusqlite::Connection, id: &str) -> Result<Option<Capsule>> {
        let sql = format!("SELECT {CAPSULE_COLUMNS} FROM capsules WHERE id = ?1");
        let mut stmt = conn.prepare(&sql).map_err(|e| store_err("Prepare", e))?;
        let mut rows = stmt
            .query_map([id], row_to_capsule)
            .map_err(|e| store_err("Find capsule", e))?;
        rows.next()
            .transpose()
            .map_err(|e| store_err("Read capsule", e))
    }

    fn insert(conn: &rusqlite::Connection, capsule: &Capsule) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO capsules ({CAPSULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            rusqlite::params![
                capsule.id,
                capsule.recipient,
                capsule.subject,
                capsule.message,
                ts(capsule.scheduled_at),
                capsule.status.as_str(),
                ts(capsule.created_at),
                ts(capsule.updated_at),
                capsule.delivered_at.map(ts),
                capsule.last_error,
                attachments_json(capsule)?,
            ],
        )
        .map_err(|e| store_err("Save capsule", e))?;
        Ok(())
    }

    /// Overwrite the mutable columns of `capsule`, guarded by `expected` status.
    /// Returns `false` when no row matched.
    fn update_if(
        conn: &rusqlite::Connection,
        capsule: &Capsule,
        expected: CapsuleStatus,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE capsules
                 SET recipient = ?3,
                     subject = ?4,
                     message = ?5,
                     scheduled_at = ?6,
                     status = ?7,
                     updated_at = ?8,
                     last_error = ?9,
                     attachments = ?10
                 WHERE id = ?1 AND status = ?2",
                rusqlite::params![
                    capsule.id,
                    expected.as_str(),
                    capsule.recipient,
                    capsule.subject,
                    capsule.message,
                    ts(capsule.scheduled_at),
                    capsule.status.as_str(),
                    ts(capsule.updated_at),
                    capsule.last_error,
                    attachments_json(capsule)?,
                ],
            )
            .map_err(|e| store_err("Update capsule", e))?;
        Ok(changed == 1)
    }
}

#[async_trait]
impl CapsuleStore for SqliteStore {
    async fn create(&self, capsule: Capsule) -> Result<Capsule> {
        Self::insert(&self.conn(), &capsule)?;
        tracing::debug!("💾 Capsule stored: {}", capsule.id);
        Ok(capsule)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Capsule>> {
        Self::select_one(&self.conn(), id)
    }

    async fn find_all(&self) -> Result<Vec<Capsule>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules ORDER BY scheduled_at ASC, created_at ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| store_err("Prepare", e))?;
        let rows = stmt
            .query_map([], row_to_capsule)
            .map_err(|e| store_err("List capsules", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| store_err("Read capsule", e))
    }

    async fn update(
        &self,
        id: &str,
        expected: CapsuleStatus,
        patch: CapsulePatch,
    ) -> Result<Capsule> {
        let conn = self.conn();
        let mut capsule =
            Self::select_one(&conn, id)?.ok_or_else(|| CapsuleError::NotFound(id.to_string()))?;
        if capsule.status != expected {
            return Err(CapsuleError::ConcurrencyConflict(id.to_string()));
        }
        patch.apply_to(&mut capsule);
        // The status guard is repeated in SQL: another process may share the file.
        if !Self::update_if(&conn, &capsule, expected)? {
            return match Self::select_one(&conn, id)? {
                Some(_) => Err(CapsuleError::ConcurrencyConflict(id.to_string())),
                None => Err(CapsuleError::NotFound(id.to_string())),
            };
        }
        Ok(capsule)
    }

    async fn transition(
        &self,
        id: &str,
        from: CapsuleStatus,
        to: CapsuleStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let now = ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE capsules
                 SET status = ?3,
                     updated_at = ?4,
                     last_error = ?5,
                     delivered_at = CASE WHEN ?3 = 'sent' THEN ?4 ELSE delivered_at END
                 WHERE id = ?1 AND status = ?2",
                rusqlite::params![id, from.as_str(), to.as_str(), now, error],
            )
            .map_err(|e| store_err("Transition capsule", e))?;
        Ok(changed == 1)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let removed = conn
            .execute(
                "DELETE FROM capsules WHERE id = ?1 AND status <> 'sending'",
                [id],
            )
            .map_err(|e| store_err("Delete capsule", e))?;
        if removed > 0 {
            return Ok(true);
        }
        match Self::select_one(&conn, id)? {
            Some(_) => Err(CapsuleError::ConcurrencyConflict(id.to_string())),
            None => Ok(false),
        }
    }
}

fn attachments_json(capsule: &Capsule) -> Result<String> {
    serde_json::to_string(&capsule.attachments)
        .map_err(|e| CapsuleError::Store(format!("Serialize attachments: {e}")))
}

fn store_err(context: &str, e: rusqlite::Error) -> CapsuleError {
    CapsuleError::Store(format!("{context}: {e}"))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_capsule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Capsule> {
    let status_str: String = row.get(5)?;
    let status = status_str
        .parse::<CapsuleStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    let delivered_at = match row.get::<_, Option<String>>(8)? {
        Some(raw) => Some(parse_ts(8, &raw)?),
        None => None,
    };

    let attachments_str: String = row.get(10)?;
    let attachments = serde_json::from_str(&attachments_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

    Ok(Capsule {
        id: row.get(0)?,
        recipient: row.get(1)?,
        subject: row.get(2)?,
        message: row.get(3)?,
        scheduled_at: parse_ts(4, &row.get::<_, String>(4)?)?,
        status,
        created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
        updated_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        delivered_at,
        last_error: row.get(9)?,
        attachments,
    })
}
