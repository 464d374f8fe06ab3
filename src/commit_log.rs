//! # Commit Log
//!
//! The durable log collaborator. The persistence stage hands it the
//! commit/abort decisions of one batch at a time, and treats a successful
//! return as "durable".
//!
//! ## Record Semantics
//!
//! | Decision | Stored as | Existing row |
//! |----------|-----------|--------------|
//! | `Committed(ts)` | `commit_ts = ts` | replaced |
//! | `Aborted` | `commit_ts = NULL` | kept |
//!
//! An abort never overwrites a recorded commit. A client that aborts after
//! its commit was already decided gets an acknowledgement, but the commit
//! stands. Writing the same decision twice is a no-op, so replays are safe.
//!
//! ## Implementations
//!
//! - [`SqliteCommitLog`]: one connection per persistence worker
//! - [`MemoryCommitLog`]: shared in-process map with failure and latency
//!   injection, for tests

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::schema::Database;
use crate::types::Timestamp;

// =============================================================================
// Records
// =============================================================================

/// The final outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Committed(Timestamp),
    Aborted,
}

/// One durable decision, keyed by the transaction's start timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRecord {
    pub start: Timestamp,
    pub decision: Decision,
}

// =============================================================================
// CommitLog Trait
// =============================================================================

/// A durable store of commit decisions.
///
/// Each persistence worker owns its own instance, so methods take `&mut self`
/// and implementations need not be `Sync`.
pub trait CommitLog: Send + 'static {
    /// Durably appends every record, or fails as a whole.
    fn append(&mut self, records: &[CommitRecord]) -> Result<()>;

    /// Looks up the recorded decision for a transaction.
    fn get(&mut self, start: Timestamp) -> Result<Option<Decision>>;
}

// =============================================================================
// SQLite Backend
// =============================================================================

/// Commit log stored in `commit_table`.
#[derive(Debug)]
pub struct SqliteCommitLog {
    conn: Connection,
}

impl SqliteCommitLog {
    /// Opens (and initializes, if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?.into_connection()))
    }

    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

impl CommitLog for SqliteCommitLog {
    fn append(&mut self, records: &[CommitRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut commit_stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO commit_table (start_ts, commit_ts) VALUES (?1, ?2)",
            )?;
            let mut abort_stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO commit_table (start_ts, commit_ts) VALUES (?1, NULL)",
            )?;

            for record in records {
                let start = to_sql(record.start)?;
                match record.decision {
                    Decision::Committed(commit) => {
                        commit_stmt.execute(params![start, to_sql(commit)?])?;
                    }
                    Decision::Aborted => {
                        abort_stmt.execute(params![start])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&mut self, start: Timestamp) -> Result<Option<Decision>> {
        let row: Option<Option<i64>> = self
            .conn
            .prepare_cached("SELECT commit_ts FROM commit_table WHERE start_ts = ?1")?
            .query_row([to_sql(start)?], |row| row.get(0))
            .optional()?;

        Ok(row.map(|commit| match commit {
            Some(ts) => Decision::Committed(Timestamp::from_raw(ts as u64)),
            None => Decision::Aborted,
        }))
    }
}

/// SQLite integers are signed. Timestamps above `i64::MAX` are never issued.
fn to_sql(ts: Timestamp) -> Result<i64> {
    i64::try_from(ts.as_raw())
        .map_err(|_| Error::PersistenceFailed(format!("timestamp {ts} exceeds storage range")))
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// An in-process commit log.
///
/// Clones share the same records, failure switch and append counter. Each
/// clone keeps its own artificial latency, so workers can be made to finish
/// out of submission order.
#[derive(Debug, Clone, Default)]
pub struct MemoryCommitLog {
    records: Arc<Mutex<BTreeMap<Timestamp, Decision>>>,
    failing: Arc<AtomicBool>,
    appends: Arc<AtomicU64>,
    delay: Option<Duration>,
}

impl MemoryCommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone that sleeps for `delay` before every append.
    pub fn with_delay(&self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self.clone()
        }
    }

    /// Makes every subsequent append (on any clone) fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful appends across all clones.
    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::SeqCst)
    }

    /// The recorded decision for a transaction.
    pub fn decision(&self, start: Timestamp) -> Option<Decision> {
        self.records.lock().unwrap().get(&start).copied()
    }

    /// Number of recorded transactions.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommitLog for MemoryCommitLog {
    fn append(&mut self, records: &[CommitRecord]) -> Result<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::PersistenceFailed("injected commit log failure".into()));
        }

        let mut map = self.records.lock().unwrap();
        for record in records {
            match record.decision {
                Decision::Committed(_) => {
                    map.insert(record.start, record.decision);
                }
                Decision::Aborted => {
                    map.entry(record.start).or_insert(Decision::Aborted);
                }
            }
        }
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&mut self, start: Timestamp) -> Result<Option<Decision>> {
        Ok(self.decision(start))
    }
}

// =============================================================================
// Tests
// =============================================================================
