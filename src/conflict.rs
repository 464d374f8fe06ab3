//! # Write-Write Conflict Detection
//!
//! [`ConflictMap`] remembers, for every recently written cell, the commit
//! timestamp of the last transaction that wrote it. A transaction that began
//! at `start` conflicts if any cell in its write set was committed at or after
//! `start`.
//!
//! ## Bounding the Map
//!
//! Two mechanisms keep the map from growing without limit:
//!
//! 1. **Low-watermark pruning.** Every open transaction started at or above
//!    the low watermark, so an entry committed below it can never cause a
//!    conflict again and is dropped.
//! 2. **Capacity eviction.** If the map still exceeds its capacity, the oldest
//!    entries are evicted and the *floor* is raised to the newest evicted
//!    commit timestamp. Any transaction that started at or below the floor
//!    aborts, since one of its conflicts might have been forgotten.
//!
//! The floor is also how a restarted oracle fences off transactions begun by
//! the previous incarnation: it starts at the recovered reservation bound.
//!
//! [`OpenTransactions`] tracks undecided start timestamps; its minimum is the
//! low-watermark candidate.

use std::collections::{BTreeSet, HashMap};

use crate::types::{CellId, Timestamp};

/// Share of capacity kept after an eviction, in percent.
const EVICTION_TARGET_PERCENT: usize = 90;

// =============================================================================
// ConflictMap
// =============================================================================

/// Last commit timestamp per written cell.
#[derive(Debug)]
pub struct ConflictMap {
    cells: HashMap<CellId, Timestamp>,
    capacity: usize,
    floor: Timestamp,
}

impl ConflictMap {
    /// Creates an empty map. Transactions started at or below `floor` abort.
    pub fn new(capacity: usize, floor: Timestamp) -> Self {
        Self {
            cells: HashMap::new(),
            capacity: capacity.max(1),
            floor,
        }
    }

    /// True if committing `write_set` for a transaction started at `start`
    /// would violate snapshot isolation, or cannot be proven not to.
    pub fn conflicts(&self, start: Timestamp, write_set: &[CellId]) -> bool {
        if start <= self.floor {
            return true;
        }
        write_set
            .iter()
            .any(|cell| self.cells.get(cell).is_some_and(|committed| *committed >= start))
    }

    /// Records a commit. Returns the number of entries evicted for capacity.
    pub fn record(&mut self, commit: Timestamp, write_set: &[CellId]) -> usize {
        for cell in write_set {
            self.cells.insert(*cell, commit);
        }
        if self.cells.len() > self.capacity {
            self.evict()
        } else {
            0
        }
    }

    /// Drops every entry committed below `low_watermark`.
    pub fn prune_below(&mut self, low_watermark: Timestamp) -> usize {
        let before = self.cells.len();
        self.cells.retain(|_, committed| *committed >= low_watermark);
        before - self.cells.len()
    }

    fn evict(&mut self) -> usize {
        let keep = (self.capacity * EVICTION_TARGET_PERCENT / 100).max(1);
        let excess = self.cells.len().saturating_sub(keep);
        if excess == 0 {
            return 0;
        }

        let mut stamps: Vec<Timestamp> = self.cells.values().copied().collect();
        let (_, cutoff, _) = stamps.select_nth_unstable(excess - 1);
        let cutoff = *cutoff;

        let before = self.cells.len();
        self.cells.retain(|_, committed| *committed > cutoff);
        if cutoff > self.floor {
            self.floor = cutoff;
        }
        before - self.cells.len()
    }

    /// Transactions started at or below this value abort.
    pub fn floor(&self) -> Timestamp {
        self.floor
    }

    /// The latest commit recorded for `cell`, if it is still tracked.
    pub fn committed(&self, cell: CellId) -> Option<Timestamp> {
        self.cells.get(&cell).copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// =============================================================================
// OpenTransactions
// =============================================================================

/// Start timestamps of transactions that have not been decided yet.
#[derive(Debug)]
pub struct OpenTransactions {
    open: BTreeSet<Timestamp>,
    max_open: usize,
}

impl OpenTransactions {
    pub fn new(max_open: usize) -> Self {
        Self {
            open: BTreeSet::new(),
            max_open: max_open.max(1),
        }
    }

    /// Tracks a new transaction. Returns the oldest transaction if it had to
    /// be expired to stay within bounds.
    pub fn begin(&mut self, start: Timestamp) -> Option<Timestamp> {
        self.open.insert(start);
        if self.open.len() > self.max_open {
            self.open.pop_first()
        } else {
            None
        }
    }

    /// Stops tracking a transaction. Returns false if it was not open.
    pub fn finish(&mut self, start: Timestamp) -> bool {
        self.open.remove(&start)
    }

    pub fn contains(&self, start: Timestamp) -> bool {
        self.open.contains(&start)
    }

    /// The oldest undecided start timestamp.
    pub fn oldest(&self) -> Option<Timestamp> {
        self.open.first().copied()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
