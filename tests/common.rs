#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tsoracle::{CellId, Database, MemoryBackends, RecordingPanicker, Tso, TsoConfig};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

/// The stored commit timestamp for `start`: `Some(None)` for an abort,
/// `None` if nothing was recorded.
pub fn stored_decision(conn: &Connection, start: u64) -> Option<Option<i64>> {
    conn.query_row(
        "SELECT commit_ts FROM commit_table WHERE start_ts = ?",
        [start as i64],
        |row| row.get(0),
    )
    .ok()
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Small batches and a short timeout, so tests exercise many hand-offs.
pub fn small_batch_config(writers: usize, batch_max_size: usize) -> TsoConfig {
    TsoConfig {
        num_concurrent_writers: writers,
        batch_max_size,
        batch_timeout: Duration::from_millis(2),
        timestamp_reservation: 1000,
        ..TsoConfig::default()
    }
}

pub fn open_memory(config: TsoConfig) -> (Tso, MemoryBackends, RecordingPanicker) {
    let memory = MemoryBackends::new();
    let panicker = RecordingPanicker::new();
    let tso = Tso::with_backends(
        config.clone(),
        memory.backends(config.num_concurrent_writers),
        Arc::new(panicker.clone()),
    )
    .expect("open oracle");
    (tso, memory, panicker)
}

pub fn row(key: &str) -> CellId {
    CellId::from_key(key)
}
