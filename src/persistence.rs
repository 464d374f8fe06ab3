//! # Persistence Stage
//!
//! Makes the decisions of every closed batch durable before any of its
//! replies may be sent.
//!
//! ## Worker Pool
//!
//! ```text
//!                        ┌──────────┐
//!                   ┌───►│ worker 0 │──┐
//!  ClosedBatch      │    └──────────┘  │      PersistEvent
//!  ───────────► [queue]  ┌──────────┐  ├────► (reply stage)
//!                   ├───►│ worker 1 │──┤
//!                   │    └──────────┘  │
//!                   └───►    ...     ──┘
//! ```
//!
//! Each worker runs on its own thread and owns its own [`CommitLog`]
//! instance (for SQLite, its own connection). Workers compete for batches
//! through a shared receiver, so batch `n + 1` may become durable before
//! batch `n`. Restoring order is the reply stage's job.
//!
//! ## Per-Batch Steps
//!
//! 1. Look up every commit retry the sequencing stage could not answer
//! 2. Append every commit/abort decision in one call
//! 3. Emit a [`PersistEvent`] carrying the batch and the outcome
//!
//! ## Failure Policy
//!
//! | Policy | On a failed append |
//! |--------|--------------------|
//! | `Abort` | Fatal through the panicker; the worker stops |
//! | `ReplyError` | `PersistStatus::Failed` is emitted and every request in the batch gets an error reply |

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::batch::ClosedBatch;
use crate::commit_log::CommitLog;
use crate::config::DurabilityFailurePolicy;
use crate::error::{Error, Result};
use crate::metrics::TsoMetrics;
use crate::panicker::{self, Panicker};

/// Monitoring timer covering the durable append.
pub const PERSIST_TIMER: &str = "persist";

// =============================================================================
// Events
// =============================================================================

/// The outcome of persisting one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistStatus {
    /// Every decision in the batch is durable.
    Durable,

    /// The append failed; nothing in the batch may be acknowledged.
    Failed(String),
}

/// A completion event, delivered to the reply stage.
#[derive(Debug)]
pub struct PersistEvent {
    pub batch: ClosedBatch,
    pub status: PersistStatus,
}

impl PersistEvent {
    pub fn durable(batch: ClosedBatch) -> Self {
        Self {
            batch,
            status: PersistStatus::Durable,
        }
    }

    pub fn failed(batch: ClosedBatch, reason: impl Into<String>) -> Self {
        Self {
            batch,
            status: PersistStatus::Failed(reason.into()),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Submits closed batches to the worker pool.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: std_mpsc::Sender<ClosedBatch>,
}

impl PersistenceHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: std_mpsc::Sender<ClosedBatch>) -> Self {
        Self { tx }
    }

    /// Queues a batch. Never blocks: the batch pool already bounds how many
    /// batches can be queued.
    pub fn submit(&self, batch: ClosedBatch) -> Result<()> {
        self.tx
            .send(batch)
            .map_err(|_| Error::ShutDown("persistence processor"))
    }
}

// =============================================================================
// PersistenceProcessor
// =============================================================================

/// The pool of durability writers.
#[derive(Debug)]
pub struct PersistenceProcessor {
    handle: PersistenceHandle,
    workers: Vec<JoinHandle<()>>,
}

impl PersistenceProcessor {
    /// Spawns one worker thread per commit log.
    ///
    /// Completion events are sent on `events`. The processor keeps no sender
    /// of its own, so the reply stage sees the channel close once every
    /// worker has exited.
    pub fn spawn(
        logs: Vec<Box<dyn CommitLog>>,
        events: std_mpsc::Sender<PersistEvent>,
        policy: DurabilityFailurePolicy,
        panicker: Arc<dyn Panicker>,
        metrics: Arc<TsoMetrics>,
    ) -> Result<Self> {
        if logs.is_empty() {
            return Err(Error::Config("at least one commit log is required".into()));
        }

        let (tx, rx) = std_mpsc::channel::<ClosedBatch>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(logs.len());

        for (id, log) in logs.into_iter().enumerate() {
            let worker = Worker {
                id,
                log,
                rx: Arc::clone(&rx),
                events: events.clone(),
                policy,
                panicker: Arc::clone(&panicker),
                metrics: Arc::clone(&metrics),
            };
            let thread = std::thread::Builder::new()
                .name(format!("tso-persist-{id}"))
                .spawn(move || worker.run())
                .map_err(|e| Error::Fatal(format!("failed to spawn persistence worker: {e}")))?;
            workers.push(thread);
        }

        Ok(Self {
            handle: PersistenceHandle { tx },
            workers,
        })
    }

    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to drain the queue and exit.
    ///
    /// Workers only exit once every [`PersistenceHandle`] is dropped, so the
    /// sequencing stage must be stopped first.
    pub fn join(self) {
        drop(self.handle);
        for worker in self.workers {
            if worker.join().is_err() {
                error!("persistence worker panicked");
            }
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    id: usize,
    log: Box<dyn CommitLog>,
    rx: Arc<Mutex<std_mpsc::Receiver<ClosedBatch>>>,
    events: std_mpsc::Sender<PersistEvent>,
    policy: DurabilityFailurePolicy,
    panicker: Arc<dyn Panicker>,
    metrics: Arc<TsoMetrics>,
}

impl Worker {
    fn run(mut self) {
        loop {
            // The lock is held only while waiting for the next batch.
            let next = self.rx.lock().unwrap().recv();
            let Ok(mut batch) = next else {
                debug!(worker = self.id, "persistence worker exiting");
                break;
            };

            let event = match self.persist(&mut batch) {
                Ok(()) => PersistEvent::durable(batch),
                Err(e) => {
                    TsoMetrics::incr(&self.metrics.persistence_failures);
                    error!(worker = self.id, seq = %batch.seq(), error = %e, "failed to persist batch");
                    match self.policy {
                        DurabilityFailurePolicy::Abort => {
                            let _ = panicker::raise(
                                self.panicker.as_ref(),
                                format!("batch {} could not be made durable: {e}", batch.seq()),
                            );
                            break;
                        }
                        DurabilityFailurePolicy::ReplyError => PersistEvent::failed(batch, e.to_string()),
                    }
                }
            };

            if self.events.send(event).is_err() {
                warn!(worker = self.id, "reply processor is gone, stopping worker");
                break;
            }
        }
    }

    fn persist(&mut self, batch: &mut ClosedBatch) -> Result<()> {
        for start in batch.unresolved_retries() {
            let decision = self.log.get(start)?;
            batch.resolve_retry(start, decision);
        }

        let records = batch.records();
        for entry in batch.entries_mut() {
            entry.ctx_mut().timer_start(PERSIST_TIMER);
        }

        let started = Instant::now();
        // Timestamp-only batches have nothing to write.
        if !records.is_empty() {
            self.log.append(&records)?;
        }
        let elapsed = started.elapsed();

        for entry in batch.entries_mut() {
            entry.ctx_mut().timer_stop(PERSIST_TIMER);
        }

        TsoMetrics::incr(&self.metrics.batches_persisted);
        TsoMetrics::add(&self.metrics.records_persisted, records.len() as u64);
        TsoMetrics::add_duration(&self.metrics.persistence_micros, elapsed);
        debug!(
            worker = self.id,
            seq = %batch.seq(),
            records = records.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "batch persisted"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
