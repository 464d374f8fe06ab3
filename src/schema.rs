//! # SQLite Schema for the Oracle
//!
//! This module defines the database schema backing the concrete durable
//! collaborators: the commit log, the low-watermark store and the timestamp
//! reservation store.
//!
//! ## Table Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Schema Overview                       │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │  commit_table                 tso_metadata                │
//! │  ┌─────────────────┐          ┌─────────────────┐         │
//! │  │ start_ts (PK)   │          │ key (PK)        │         │
//! │  │ commit_ts NULL  │          │ value           │         │
//! │  └─────────────────┘          └─────────────────┘         │
//! │                                                           │
//! │  tso_metadata keys: schema_version, max_timestamp,        │
//! │                     low_watermark                         │
//! │                                                           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Multiple Writer Connections
//!
//! Every persistence worker opens its own connection to the same file. SQLite
//! admits one writer at a time even in WAL mode, so the workers serialize on
//! the write lock; the busy timeout makes a worker wait for it instead of
//! failing immediately. WAL keeps readers from blocking that writer.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: a mismatch is reported as [`Error::Schema`].
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits for the write lock held by another writer.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// The `commit_table` records every commit/abort decision.
///
/// # Columns
///
/// - `start_ts`: Start timestamp of the transaction (PK)
/// - `commit_ts`: Commit timestamp, or NULL if the transaction aborted
///
/// A recovering client looks up its start timestamp here. Appends use
/// `INSERT OR REPLACE`, so replaying a decision is idempotent.
const CREATE_COMMIT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS commit_table (
    start_ts  INTEGER PRIMARY KEY,
    commit_ts INTEGER
)
"#;

/// Key-value metadata: schema version and the oracle's durable scalars.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS tso_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Metadata key of the upper bound of the current timestamp reservation.
pub(crate) const KEY_MAX_TIMESTAMP: &str = "max_timestamp";

/// Metadata key of the last persisted low watermark.
pub(crate) const KEY_LOW_WATERMARK: &str = "low_watermark";

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the oracle schema applied.
///
/// # Ownership
///
/// `Database` owns its `Connection`. Each backend takes one via
/// [`into_connection`](Self::into_connection) and keeps it on the thread that
/// uses it.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tsoracle::Database;
    ///
    /// let db = Database::open("tso.db")?;
    /// # Ok::<(), tsoracle::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases are private to their connection, so each one is a
    /// separate store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // =====================================================================
        // Pragmas
        // =====================================================================

        // WAL: readers never block the single writer. Writers still take
        // turns on the write lock, bounded by the busy timeout below.
        // In-memory databases report "memory" and ignore the request.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;

        // FULL: a commit decision acknowledged to a client must survive an
        // OS crash, not only a process crash.
        self.conn.execute_batch("PRAGMA synchronous = FULL")?;

        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        // =====================================================================
        // Create Tables
        // =====================================================================

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_COMMIT_TABLE)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM tso_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO tso_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v.parse::<i32>().ok() == Some(SCHEMA_VERSION) => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper and returns the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Metadata Helpers
// =============================================================================

/// Reads a `u64` metadata value, if present.
pub(crate) fn read_u64(conn: &Connection, key: &str) -> Result<Option<u64>> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM tso_metadata WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()?;

    match value {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| Error::Schema(format!("corrupt metadata value for '{key}': '{v}'"))),
    }
}

/// Writes a `u64` metadata value, replacing any previous one.
pub(crate) fn write_u64(conn: &Connection, key: &str, value: u64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tso_metadata (key, value) VALUES (?, ?)",
        [key.to_string(), value.to_string()],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");

        let count: i32 = db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .expect("should query tables");

        assert_eq!(count, 2, "expected commit_table and tso_metadata");
    }

    #[test]
    fn test_schema_version_stored() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .connection()
            .query_row(
                "SELECT value FROM tso_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tso.db");

        {
            let db = Database::open(&path).unwrap();
            db.connection()
                .execute(
                    "UPDATE tso_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .unwrap();
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_metadata_helpers() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        assert_eq!(read_u64(conn, KEY_LOW_WATERMARK).unwrap(), None);
        write_u64(conn, KEY_LOW_WATERMARK, 42).unwrap();
        write_u64(conn, KEY_LOW_WATERMARK, 43).unwrap();
        assert_eq!(read_u64(conn, KEY_LOW_WATERMARK).unwrap(), Some(43));

        conn.execute(
            "INSERT INTO tso_metadata (key, value) VALUES ('max_timestamp', 'garbage')",
            [],
        )
        .unwrap();
        assert!(matches!(
            read_u64(conn, KEY_MAX_TIMESTAMP),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_readers_do_not_wait_for_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tso.db");
        let writer = Database::open(&path).unwrap();
        let reader = Database::open(&path).unwrap();

        let mode: String = writer
            .connection()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        let busy_ms: i64 = reader
            .connection()
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(busy_ms, BUSY_TIMEOUT.as_millis() as i64);

        // The write lock is held while the reader sees the last commit.
        writer
            .connection()
            .execute_batch(
                "BEGIN IMMEDIATE;
                 INSERT INTO commit_table (start_ts, commit_ts) VALUES (1, 2);",
            )
            .unwrap();
        let visible: i64 = reader
            .connection()
            .query_row("SELECT COUNT(*) FROM commit_table", [], |row| row.get(0))
            .unwrap();
        assert_eq!(visible, 0);

        writer.connection().execute_batch("COMMIT").unwrap();
        let visible: i64 = reader
            .connection()
            .query_row("SELECT COUNT(*) FROM commit_table", [], |row| row.get(0))
            .unwrap();
        assert_eq!(visible, 1);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tso.db");

        {
            let db = Database::open(&path).unwrap();
            write_u64(db.connection(), KEY_MAX_TIMESTAMP, 7).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(read_u64(db.connection(), KEY_MAX_TIMESTAMP).unwrap(), Some(7));
    }
}
