//! External user records keyed by identity token.
//!
//! The gallery only knows identities; names and contact details live in a
//! separate record store. [`SqliteUserRecords`] is the bundled implementation.

use crate::types::Identity;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub type RecordId = i64;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub record_id: RecordId,
    pub name: String,
}

pub trait UserRecordStore: Send + Sync {
    /// `CreateUser(name, email, identity) -> recordId`
    ///
    /// Implementations must be idempotent per identity so a failed commit can
    /// be retried: a second call for the same identity returns the existing id.
    fn create_user(
        &self,
        name: &str,
        email: Option<&str>,
        identity: &Identity,
    ) -> Result<RecordId, RecordError>;

    /// `LookupUserByIdentity(identity) -> {recordId, name} | not found`
    fn lookup_by_identity(&self, identity: &Identity) -> Result<Option<UserRecord>, RecordError>;
}

/// Display label for a matched identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityLabel {
    /// A record exists: `"<name> | <identity>"`.
    Recorded(String),
    /// No record, or the lookup failed: the bare token.
    Unrecorded(String),
}

impl IdentityLabel {
    pub fn text(&self) -> &str {
        match self {
            IdentityLabel::Recorded(text) | IdentityLabel::Unrecorded(text) => text,
        }
    }
}

/// Resolve the label shown for a matched identity. Lookup errors degrade to
/// the bare token.
pub fn resolve_label(records: &dyn UserRecordStore, identity: &Identity) -> IdentityLabel {
    match records.lookup_by_identity(identity) {
        Ok(Some(record)) => IdentityLabel::Recorded(format!("{} | {}", record.name, identity)),
        Ok(None) => IdentityLabel::Unrecorded(identity.to_string()),
        Err(err) => {
            tracing::warn!(identity = %identity, error = %err, "user lookup failed; showing bare identity");
            IdentityLabel::Unrecorded(identity.to_string())
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    email      TEXT,
    face_id    TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);
";

/// SQLite-backed user records.
pub struct SqliteUserRecords {
    conn: Mutex<Connection>,
}

impl SqliteUserRecords {
    pub fn open(path: &Path) -> Result<Self, RecordError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                RecordError::Unavailable(format!("{}: {e}", dir.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "user record store opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RecordError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RecordError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All records as `(record_id, name, email, identity)`, oldest first.
    pub fn list(&self) -> Result<Vec<(RecordId, String, Option<String>, String)>, RecordError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT user_id, name, email, face_id FROM users ORDER BY user_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(RecordError::from)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl UserRecordStore for SqliteUserRecords {
    fn create_user(
        &self,
        name: &str,
        email: Option<&str>,
        identity: &Identity,
    ) -> Result<RecordId, RecordError> {
        let conn = self.lock();
        let existing: Option<RecordId> = conn
            .query_row(
                "SELECT user_id FROM users WHERE face_id = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(record_id) = existing {
            tracing::debug!(identity = %identity, record_id, "user record already present");
            return Ok(record_id);
        }

        conn.execute(
            "INSERT INTO users (name, email, face_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                email,
                identity.as_str(),
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        let record_id = conn.last_insert_rowid();
        tracing::info!(identity = %identity, record_id, "user record created");
        Ok(record_id)
    }

    fn lookup_by_identity(&self, identity: &Identity) -> Result<Option<UserRecord>, RecordError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT user_id, name FROM users WHERE face_id = ?1",
            params![identity.as_str()],
            |row| {
                Ok(UserRecord {
                    record_id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(RecordError::from)
    }
}
