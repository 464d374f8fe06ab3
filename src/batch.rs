//! # Batches and the Batch Pool
//!
//! A [`Batch`] accumulates the outcomes of every request the sequencing stage
//! handles during one tick. Closing it stamps a [`BatchSeq`] and freezes it
//! into a [`ClosedBatch`], which then travels through persistence and reply
//! delivery before being cleared and returned to the [`BatchPool`].
//!
//! ```text
//!               borrow()                    submit                 on_event
//!  BatchPool ─────────────► RequestProcessor ────► PersistenceProcessor ────► ReplyProcessor
//!      ▲                    (Batch, open)          (ClosedBatch)              (ClosedBatch)
//!      │                                                                          │
//!      └──────────────────────────── release(batch) ◄─────────────────────────────┘
//! ```
//!
//! ## Ownership
//!
//! Batches move by value between stages. No stage ever holds a reference to a
//! batch another stage owns, so the "never owned by two stages" rule is
//! checked by the compiler.
//!
//! ## Invariants
//!
//! - At most `capacity` batches exist outside the pool at any time
//! - `num_active() + num_idle() == capacity()`
//! - A batch is cleared before it becomes borrowable again
//! - Only the sequencing stage can close a batch; closing consumes it

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::commit_log::{CommitRecord, Decision};
use crate::types::{BatchSeq, ClientChannel, MonitoringContext, Timestamp};

// =============================================================================
// Batch Entries
// =============================================================================

/// The state of a commit-retry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// The decision was not known to the sequencing stage. The persistence
    /// stage must look it up before the batch may reach the reply stage.
    Unresolved,

    /// The decision, or `None` if no decision was ever recorded.
    Resolved(Option<Decision>),
}

/// One reply-producing outcome.
#[derive(Debug)]
pub enum BatchEntry {
    /// A start timestamp was allocated.
    Timestamp {
        start: Timestamp,
        channel: ClientChannel,
        ctx: MonitoringContext,
    },

    /// The transaction committed.
    Commit {
        start: Timestamp,
        commit: Timestamp,
        low_watermark: Option<Timestamp>,
        channel: ClientChannel,
        ctx: MonitoringContext,
    },

    /// The transaction lost a write-write conflict.
    Abort {
        start: Timestamp,
        low_watermark: Option<Timestamp>,
        channel: ClientChannel,
        ctx: MonitoringContext,
    },

    /// The client's abort notification.
    AbortAck {
        start: Timestamp,
        channel: ClientChannel,
        ctx: MonitoringContext,
    },

    /// A commit retry, replayed or waiting to be looked up.
    CommitRetry {
        start: Timestamp,
        state: RetryState,
        channel: ClientChannel,
        ctx: MonitoringContext,
    },
}

impl BatchEntry {
    /// The decision this entry makes durable, if any.
    ///
    /// Timestamp requests carry no state needing recovery. Resolved retries
    /// write their decision again, which is idempotent and keeps a replay from
    /// being acknowledged ahead of the original write.
    pub fn decision(&self) -> Option<CommitRecord> {
        let (start, decision) = match self {
            BatchEntry::Timestamp { .. } => return None,
            BatchEntry::Commit { start, commit, .. } => (*start, Decision::Committed(*commit)),
            BatchEntry::Abort { start, .. } | BatchEntry::AbortAck { start, .. } => {
                (*start, Decision::Aborted)
            }
            BatchEntry::CommitRetry { start, state, .. } => match state {
                RetryState::Resolved(Some(decision)) => (*start, *decision),
                RetryState::Resolved(None) | RetryState::Unresolved => return None,
            },
        };
        Some(CommitRecord { start, decision })
    }

    /// The low-watermark candidate attached to a commit outcome.
    pub fn low_watermark(&self) -> Option<Timestamp> {
        match self {
            BatchEntry::Commit { low_watermark, .. } | BatchEntry::Abort { low_watermark, .. } => {
                *low_watermark
            }
            _ => None,
        }
    }

    /// The start timestamp this entry answers for.
    pub fn start(&self) -> Timestamp {
        match self {
            BatchEntry::Timestamp { start, .. }
            | BatchEntry::Commit { start, .. }
            | BatchEntry::Abort { start, .. }
            | BatchEntry::AbortAck { start, .. }
            | BatchEntry::CommitRetry { start, .. } => *start,
        }
    }

    pub fn channel(&self) -> &ClientChannel {
        match self {
            BatchEntry::Timestamp { channel, .. }
            | BatchEntry::Commit { channel, .. }
            | BatchEntry::Abort { channel, .. }
            | BatchEntry::AbortAck { channel, .. }
            | BatchEntry::CommitRetry { channel, .. } => channel,
        }
    }

    pub fn ctx(&self) -> &MonitoringContext {
        match self {
            BatchEntry::Timestamp { ctx, .. }
            | BatchEntry::Commit { ctx, .. }
            | BatchEntry::Abort { ctx, .. }
            | BatchEntry::AbortAck { ctx, .. }
            | BatchEntry::CommitRetry { ctx, .. } => ctx,
        }
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut MonitoringContext {
        match self {
            BatchEntry::Timestamp { ctx, .. }
            | BatchEntry::Commit { ctx, .. }
            | BatchEntry::Abort { ctx, .. }
            | BatchEntry::AbortAck { ctx, .. }
            | BatchEntry::CommitRetry { ctx, .. } => ctx,
        }
    }
}

// =============================================================================
// Batch
// =============================================================================

/// An open batch, owned by the sequencing stage while it accumulates.
#[derive(Debug)]
pub struct Batch {
    slot: usize,
    max_size: usize,
    entries: Vec<BatchEntry>,
}

impl Batch {
    /// Creates an empty batch for pool slot `slot`.
    pub fn new(slot: usize, max_size: usize) -> Self {
        Self {
            slot,
            max_size,
            entries: Vec::with_capacity(max_size),
        }
    }

    /// The pool slot this batch occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn add_timestamp(&mut self, start: Timestamp, channel: ClientChannel, ctx: MonitoringContext) {
        self.entries.push(BatchEntry::Timestamp { start, channel, ctx });
    }

    pub fn add_commit(
        &mut self,
        start: Timestamp,
        commit: Timestamp,
        channel: ClientChannel,
        ctx: MonitoringContext,
        low_watermark: Option<Timestamp>,
    ) {
        self.entries.push(BatchEntry::Commit {
            start,
            commit,
            low_watermark,
            channel,
            ctx,
        });
    }

    pub fn add_abort(
        &mut self,
        start: Timestamp,
        channel: ClientChannel,
        ctx: MonitoringContext,
        low_watermark: Option<Timestamp>,
    ) {
        self.entries.push(BatchEntry::Abort {
            start,
            low_watermark,
            channel,
            ctx,
        });
    }

    pub fn add_abort_ack(&mut self, start: Timestamp, channel: ClientChannel, ctx: MonitoringContext) {
        self.entries.push(BatchEntry::AbortAck { start, channel, ctx });
    }

    pub fn add_commit_retry(
        &mut self,
        start: Timestamp,
        state: RetryState,
        channel: ClientChannel,
        ctx: MonitoringContext,
    ) {
        self.entries.push(BatchEntry::CommitRetry {
            start,
            state,
            channel,
            ctx,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the size-based hand-off boundary is reached.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    /// Drops every entry, keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

// =============================================================================
// ClosedBatch
// =============================================================================

/// A batch frozen at hand-off and tagged with its sequence number.
///
/// There is no way to add entries to a closed batch or to reopen it; the
/// only way back to a [`Batch`] is [`into_batch`](Self::into_batch), which
/// the reply stage calls after delivery.
#[derive(Debug)]
pub struct ClosedBatch {
    seq: BatchSeq,
    batch: Batch,
}

impl ClosedBatch {
    pub fn new(seq: BatchSeq, batch: Batch) -> Self {
        Self { seq, batch }
    }

    pub fn seq(&self) -> BatchSeq {
        self.seq
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.batch.entries
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Every decision in this batch that must be durable before replying.
    pub fn records(&self) -> Vec<CommitRecord> {
        self.batch.entries.iter().filter_map(BatchEntry::decision).collect()
    }

    /// Start timestamps of retries still waiting for a lookup.
    pub fn unresolved_retries(&self) -> Vec<Timestamp> {
        self.batch
            .entries
            .iter()
            .filter_map(|entry| match entry {
                BatchEntry::CommitRetry {
                    start,
                    state: RetryState::Unresolved,
                    ..
                } => Some(*start),
                _ => None,
            })
            .collect()
    }

    /// Resolves every unresolved retry for `start`.
    pub(crate) fn resolve_retry(&mut self, start: Timestamp, decision: Option<Decision>) {
        for entry in &mut self.batch.entries {
            if let BatchEntry::CommitRetry {
                start: s, state, ..
            } = entry
            {
                if *s == start && *state == RetryState::Unresolved {
                    *state = RetryState::Resolved(decision);
                }
            }
        }
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [BatchEntry] {
        &mut self.batch.entries
    }

    /// Unfreezes the batch so it can be cleared and returned to the pool.
    pub fn into_batch(self) -> Batch {
        self.batch
    }
}

// =============================================================================
// BatchPool
// =============================================================================

#[derive(Debug)]
struct PoolInner {
    idle: Mutex<Vec<Batch>>,
    permits: Semaphore,
    capacity: usize,
}

/// A fixed set of reusable batches.
///
/// # Rust Pattern: Semaphore-Guarded Free List
///
/// The free list holds the idle batches; the semaphore counts them for
/// waiters. `release` pushes the batch before adding the permit, so a task
/// that wins a permit always finds a batch to pop.
///
/// Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct BatchPool {
    inner: Arc<PoolInner>,
}

impl BatchPool {
    /// Creates a pool of `capacity` empty batches of `max_size` entries each.
    pub fn new(capacity: usize, max_size: usize) -> Self {
        let idle = (0..capacity).rev().map(|slot| Batch::new(slot, max_size)).collect();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                permits: Semaphore::new(capacity),
                capacity,
            }),
        }
    }

    /// Borrows a batch, waiting while every batch is in flight.
    pub async fn borrow(&self) -> Batch {
        // The semaphore is never closed.
        let permit = match self.inner.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("batch pool semaphore closed"),
        };
        permit.forget();
        self.pop()
    }

    /// Borrows a batch if one is idle.
    pub fn try_borrow(&self) -> Option<Batch> {
        let permit = self.inner.permits.try_acquire().ok()?;
        permit.forget();
        Some(self.pop())
    }

    fn pop(&self) -> Batch {
        let mut idle = self.inner.idle.lock().unwrap();
        match idle.pop() {
            Some(batch) => batch,
            None => unreachable!("batch pool permit without an idle batch"),
        }
    }

    /// Clears a batch and makes it available again.
    pub fn release(&self, mut batch: Batch) {
        batch.clear();
        self.inner.idle.lock().unwrap().push(batch);
        self.inner.permits.add_permits(1);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn num_idle(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Batches currently open, being persisted or awaiting reply.
    pub fn num_active(&self) -> usize {
        self.capacity() - self.num_idle()
    }
}

// =============================================================================
// Tests
// =============================================================================
