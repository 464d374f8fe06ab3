//! # Low Watermark Persistence
//!
//! The low watermark is a single scalar: every transaction that started below
//! it has been decided. It is written by the reply stage and read back on
//! startup.
//!
//! [`LowWatermarkWriter`] owns the store on a dedicated thread so the reply
//! stage never waits on a durable write. It accepts only strictly increasing
//! values; anything else is dropped before it reaches the store.

use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::schema::{self, Database, KEY_LOW_WATERMARK};
use crate::types::Timestamp;

// =============================================================================
// Store
// =============================================================================

/// Durable home of the low watermark.
pub trait LowWatermarkStore: Send + 'static {
    /// The last persisted value, if any.
    fn load(&mut self) -> Result<Option<Timestamp>>;

    /// Durably replaces the stored value.
    fn persist(&mut self, low_watermark: Timestamp) -> Result<()>;
}

/// Stores the low watermark in `tso_metadata`.
#[derive(Debug)]
pub struct SqliteLowWatermarkStore {
    conn: Connection,
}

impl SqliteLowWatermarkStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?.into_connection()))
    }

    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

impl LowWatermarkStore for SqliteLowWatermarkStore {
    fn load(&mut self) -> Result<Option<Timestamp>> {
        Ok(schema::read_u64(&self.conn, KEY_LOW_WATERMARK)?.map(Timestamp::from_raw))
    }

    fn persist(&mut self, low_watermark: Timestamp) -> Result<()> {
        schema::write_u64(&self.conn, KEY_LOW_WATERMARK, low_watermark.as_raw())
    }
}

/// In-process store that remembers every value it was asked to persist.
///
/// Clones share the history.
#[derive(Debug, Clone, Default)]
pub struct MemoryLowWatermarkStore {
    history: Arc<Mutex<Vec<Timestamp>>>,
}

impl MemoryLowWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted value, in call order.
    pub fn history(&self) -> Vec<Timestamp> {
        self.history.lock().unwrap().clone()
    }
}

impl LowWatermarkStore for MemoryLowWatermarkStore {
    fn load(&mut self) -> Result<Option<Timestamp>> {
        Ok(self.history.lock().unwrap().last().copied())
    }

    fn persist(&mut self, low_watermark: Timestamp) -> Result<()> {
        self.history.lock().unwrap().push(low_watermark);
        Ok(())
    }
}

// =============================================================================
// LowWatermarkWriter
// =============================================================================

struct PersistRequest {
    value: Timestamp,
    response: oneshot::Sender<Result<()>>,
}

/// Persists increasing low-watermark values on a dedicated thread.
///
/// Requests are written in the order they were made. The returned receiver
/// resolves once the value is durable; callers that do not need to wait can
/// drop it.
pub struct LowWatermarkWriter {
    tx: std_mpsc::Sender<PersistRequest>,
    thread: JoinHandle<()>,
    last_requested: Option<Timestamp>,
}

impl LowWatermarkWriter {
    /// Spawns the writer thread. `initial` is the value already durable, if
    /// known; nothing at or below it will be written.
    pub fn spawn(mut store: Box<dyn LowWatermarkStore>, initial: Option<Timestamp>) -> Result<Self> {
        let (tx, rx) = std_mpsc::channel::<PersistRequest>();

        let thread = std::thread::Builder::new()
            .name("tso-lwm-writer".to_string())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    let result = store.persist(request.value);
                    match &result {
                        Ok(()) => debug!(low_watermark = request.value.as_raw(), "low watermark persisted"),
                        Err(e) => error!(
                            low_watermark = request.value.as_raw(),
                            error = %e,
                            "failed to persist low watermark"
                        ),
                    }
                    let _ = request.response.send(result);
                }
            })
            .map_err(|e| Error::Fatal(format!("failed to spawn low watermark writer: {e}")))?;

        Ok(Self {
            tx,
            thread,
            last_requested: initial,
        })
    }

    /// Queues `low_watermark` for persistence.
    ///
    /// A value not strictly greater than the last one requested is
    /// suppressed: the returned receiver resolves immediately with `Ok`.
    pub fn persist_low_watermark(&mut self, low_watermark: Timestamp) -> oneshot::Receiver<Result<()>> {
        let (response, rx) = oneshot::channel();

        if self.last_requested.is_some_and(|last| low_watermark <= last) {
            let _ = response.send(Ok(()));
            return rx;
        }
        self.last_requested = Some(low_watermark);

        let request = PersistRequest {
            value: low_watermark,
            response,
        };
        if let Err(std_mpsc::SendError(request)) = self.tx.send(request) {
            let _ = request
                .response
                .send(Err(Error::ShutDown("low watermark writer")));
        }
        rx
    }

    /// The highest value requested so far.
    pub fn last_requested(&self) -> Option<Timestamp> {
        self.last_requested
    }

    /// Finishes every queued write and stops the thread.
    pub fn shutdown(self) {
        drop(self.tx);
        if self.thread.join().is_err() {
            error!("low watermark writer thread panicked");
        }
    }
}

impl std::fmt::Debug for LowWatermarkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowWatermarkWriter")
            .field("last_requested", &self.last_requested)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
