//! # Timestamp Oracle
//!
//! Issues strictly increasing timestamps that stay strictly increasing across
//! restarts.
//!
//! ## Reservations
//!
//! Persisting every timestamp would put a durable write on the sequencing
//! path. Instead the oracle reserves a block of timestamps by durably storing
//! the block's upper bound, then hands them out from memory:
//!
//! ```text
//!   recovered        last issued          max_allocated (durable)
//!      │                 │                        │
//!  ────┼─────────────────┼────────────────────────┼──────────►
//!      │◄── issued ─────►│◄──── free to issue ───►│
//! ```
//!
//! After a crash, issuing resumes above the stored bound, so no timestamp is
//! ever handed out twice even though the last few issued were never written
//! anywhere. The unissued remainder of the block is skipped.
//!
//! ## Prefetch
//!
//! [`TimestampOracle::maintain`] starts the next reservation on the blocking
//! pool once half the block is used, and collects it when it finishes. The
//! sequencing stage only waits on storage if a block runs out before its
//! successor is durable.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::schema::{self, Database, KEY_MAX_TIMESTAMP};
use crate::types::Timestamp;

// =============================================================================
// Storage
// =============================================================================

/// Durable home of the reservation bound.
pub trait TimestampStorage: Send + 'static {
    /// The last stored bound, or `None` on a cold start.
    fn load_max_timestamp(&mut self) -> Result<Option<Timestamp>>;

    /// Durably stores a new bound.
    fn store_max_timestamp(&mut self, max: Timestamp) -> Result<()>;
}

/// Stores the bound in `tso_metadata`.
#[derive(Debug)]
pub struct SqliteTimestampStorage {
    conn: Connection,
}

impl SqliteTimestampStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?.into_connection()))
    }

    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

impl TimestampStorage for SqliteTimestampStorage {
    fn load_max_timestamp(&mut self) -> Result<Option<Timestamp>> {
        Ok(schema::read_u64(&self.conn, KEY_MAX_TIMESTAMP)?.map(Timestamp::from_raw))
    }

    fn store_max_timestamp(&mut self, max: Timestamp) -> Result<()> {
        schema::write_u64(&self.conn, KEY_MAX_TIMESTAMP, max.as_raw())
    }
}

/// In-process storage. Clones share the stored bound.
#[derive(Debug, Clone, Default)]
pub struct MemoryTimestampStorage {
    max: Arc<Mutex<Option<Timestamp>>>,
}

impl MemoryTimestampStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently stored bound.
    pub fn stored(&self) -> Option<Timestamp> {
        *self.max.lock().unwrap()
    }
}

impl TimestampStorage for MemoryTimestampStorage {
    fn load_max_timestamp(&mut self) -> Result<Option<Timestamp>> {
        Ok(self.stored())
    }

    fn store_max_timestamp(&mut self, max: Timestamp) -> Result<()> {
        *self.max.lock().unwrap() = Some(max);
        Ok(())
    }
}

// =============================================================================
// Reservations
// =============================================================================

/// The storage plus the highest bound known to be durable.
///
/// Shared between the oracle and its background refill; a bound is only
/// written if it is higher than the durable one, so a late refill can never
/// move the stored bound backwards.
struct Reservations {
    storage: Box<dyn TimestampStorage>,
    durable: Timestamp,
}

impl Reservations {
    fn extend_to(&mut self, bound: Timestamp) -> Result<Timestamp> {
        if bound > self.durable {
            self.storage.store_max_timestamp(bound)?;
            self.durable = bound;
        }
        Ok(self.durable)
    }
}

// =============================================================================
// TimestampOracle
// =============================================================================

/// The single source of timestamps.
pub struct TimestampOracle {
    last: Timestamp,
    max_allocated: Timestamp,
    recovered: Timestamp,
    reservation: u64,
    reservations: Arc<Mutex<Reservations>>,
    refill: Option<JoinHandle<Result<Timestamp>>>,
}

impl TimestampOracle {
    /// Recovers the stored bound and durably reserves the first block.
    ///
    /// On a cold start issuing begins just above `initial`.
    pub fn open(
        mut storage: Box<dyn TimestampStorage>,
        initial: Timestamp,
        reservation: u64,
    ) -> Result<Self> {
        let loaded = storage.load_max_timestamp()?;
        let recovered = loaded.map_or(initial, |stored| stored.max(initial));
        let bound = recovered.saturating_add(reservation.max(1));
        storage.store_max_timestamp(bound)?;

        info!(
            recovered = recovered.as_raw(),
            reserved_to = bound.as_raw(),
            cold_start = loaded.is_none(),
            "timestamp oracle opened"
        );

        Ok(Self {
            last: recovered,
            max_allocated: bound,
            recovered,
            reservation: reservation.max(1),
            reservations: Arc::new(Mutex::new(Reservations {
                storage,
                durable: bound,
            })),
            refill: None,
        })
    }

    /// Issues the next timestamp.
    ///
    /// Never waits on storage unless the current block is used up, which
    /// [`maintain`](Self::maintain) normally prevents.
    pub fn next(&mut self) -> Result<Timestamp> {
        if self.last >= self.max_allocated {
            self.reserve_now()?;
        }
        self.last = self
            .last
            .checked_next()
            .ok_or_else(|| Error::Fatal("timestamp space exhausted".to_string()))?;
        Ok(self.last)
    }

    /// The last timestamp issued (the recovered bound if none yet).
    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// The bound recovered at startup. Every timestamp a previous
    /// incarnation could have issued is at or below it.
    pub fn recovered(&self) -> Timestamp {
        self.recovered
    }

    /// The current durable upper bound.
    pub fn max_allocated(&self) -> Timestamp {
        self.max_allocated
    }

    fn remaining(&self) -> u64 {
        self.max_allocated.as_raw().saturating_sub(self.last.as_raw())
    }

    /// Starts or collects a background reservation as needed.
    pub async fn maintain(&mut self) -> Result<()> {
        let finished = self.refill.as_ref().is_some_and(|h| h.is_finished());
        if finished || (self.refill.is_some() && self.remaining() == 0) {
            self.complete_refill().await?;
        }

        if self.refill.is_none() && self.remaining() <= self.reservation / 2 {
            self.start_refill();
            if self.remaining() == 0 {
                self.complete_refill().await?;
            }
        }
        Ok(())
    }

    fn start_refill(&mut self) {
        let target = self.max_allocated.saturating_add(self.reservation);
        let reservations = Arc::clone(&self.reservations);
        debug!(target = target.as_raw(), "prefetching timestamp reservation");
        self.refill = Some(tokio::task::spawn_blocking(move || {
            reservations.lock().unwrap().extend_to(target)
        }));
    }

    async fn complete_refill(&mut self) -> Result<()> {
        if let Some(handle) = self.refill.take() {
            let bound = handle
                .await
                .map_err(|e| Error::Fatal(format!("timestamp reservation task failed: {e}")))??;
            self.max_allocated = self.max_allocated.max(bound);
        }
        Ok(())
    }

    fn reserve_now(&mut self) -> Result<()> {
        let target = self.max_allocated.saturating_add(self.reservation);
        let bound = self.reservations.lock().unwrap().extend_to(target)?;
        if bound <= self.last {
            return Err(Error::Fatal(format!(
                "timestamp reservation did not advance past {}",
                self.last
            )));
        }
        self.max_allocated = self.max_allocated.max(bound);
        Ok(())
    }
}

impl std::fmt::Debug for TimestampOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampOracle")
            .field("last", &self.last)
            .field("max_allocated", &self.max_allocated)
            .field("refill_pending", &self.refill.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
