//! # Sequencing Stage
//!
//! The [`RequestProcessor`] is the single authority that gives the oracle
//! its global order. It allocates every timestamp, runs every conflict check
//! and records every outcome into the open batch. All of this happens on one
//! thread, so none of its state needs a lock.
//!
//! ## Request Handling
//!
//! | Request | Effect | Batch entry |
//! |---------|--------|-------------|
//! | Timestamp | Allocate start ts, track as open | `Timestamp` |
//! | Commit (no conflict) | Allocate commit ts, update conflict map | `Commit` |
//! | Commit (conflict) | Nothing else | `Abort` |
//! | Commit (already decided) | Replay the decision | `CommitRetry` (resolved) |
//! | Commit (not open, not cached) | Ask the commit log | `CommitRetry` (unresolved) |
//! | Commit retry | Replay, or ask the commit log | `CommitRetry` |
//! | Abort | Stop tracking; conflict map untouched | `AbortAck` |
//!
//! A transaction stops being "open" once it is decided. Commit outcomes carry
//! a low-watermark candidate: the oldest transaction still open after the
//! decision.
//!
//! ## Hand-off and Backpressure
//!
//! The run loop closes the open batch when it is full or has been open for
//! `batch_timeout`, submits it for persistence, then borrows a fresh batch
//! from the pool. That borrow is the only place the loop waits: when every
//! batch is in flight, no request is read until one comes back.
//!
//! ```text
//!   recv ──► process ──► full? ──► close ──► submit ──► borrow (may wait)
//!     ▲                                                      │
//!     └──────────────────────────────────────────────────────┘
//! ```

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchPool, ClosedBatch, RetryState};
use crate::commit_log::Decision;
use crate::config::TsoConfig;
use crate::conflict::{ConflictMap, OpenTransactions};
use crate::error::{Error, Result};
use crate::metrics::TsoMetrics;
use crate::panicker::{self, Panicker};
use crate::persistence::PersistenceHandle;
use crate::timestamp::TimestampOracle;
use crate::types::{BatchSeq, CellId, ClientChannel, MonitoringContext, Request, Response, Timestamp};

/// How long the loop sleeps when no batch is open.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

// =============================================================================
// RequestProcessor
// =============================================================================

/// The sequencing authority.
pub struct RequestProcessor {
    oracle: TimestampOracle,
    conflicts: ConflictMap,
    open: OpenTransactions,
    decisions: LruCache<Timestamp, Decision>,
    batch: Option<Batch>,
    next_seq: BatchSeq,
    pool: BatchPool,
    persistence: PersistenceHandle,
    panicker: Arc<dyn Panicker>,
    metrics: Arc<TsoMetrics>,
}

impl RequestProcessor {
    /// Creates the processor and borrows its first batch.
    ///
    /// The conflict map's floor starts at the oracle's recovered bound, so no
    /// transaction begun by a previous incarnation can be committed by this
    /// one: its conflicts were lost with that incarnation's memory.
    pub fn new(
        oracle: TimestampOracle,
        config: &TsoConfig,
        pool: BatchPool,
        persistence: PersistenceHandle,
        panicker: Arc<dyn Panicker>,
        metrics: Arc<TsoMetrics>,
    ) -> Result<Self> {
        let batch = pool
            .try_borrow()
            .ok_or_else(|| Error::Config("batch pool has no idle batch at startup".into()))?;
        let cache_size = NonZeroUsize::new(config.decision_cache_size)
            .ok_or_else(|| Error::Config("decision_cache_size must be at least 1".into()))?;

        Ok(Self {
            conflicts: ConflictMap::new(config.conflict_map_capacity, oracle.recovered()),
            open: OpenTransactions::new(config.max_open_transactions),
            decisions: LruCache::new(cache_size),
            oracle,
            batch: Some(batch),
            next_seq: BatchSeq::FIRST,
            pool,
            persistence,
            panicker,
            metrics,
        })
    }

    /// Dispatches one request.
    pub fn process(&mut self, request: Request) -> Result<()> {
        match request {
            Request::Timestamp { channel, ctx } => self.process_timestamp_request(channel, ctx),
            Request::Commit {
                start,
                write_set,
                channel,
                ctx,
            } => self.process_commit_request(start, &write_set, channel, ctx),
            Request::CommitRetry { start, channel, ctx } => {
                self.process_commit_retry(start, channel, ctx)
            }
            Request::Abort { start, channel, ctx } => self.process_abort(start, channel, ctx),
        }
    }

    /// Allocates a start timestamp and tracks the transaction as open.
    pub fn process_timestamp_request(
        &mut self,
        channel: ClientChannel,
        ctx: MonitoringContext,
    ) -> Result<()> {
        let start = self.oracle.next()?;
        if let Some(expired) = self.open.begin(start) {
            TsoMetrics::incr(&self.metrics.expired_transactions);
            warn!(start = %expired, "expired oldest open transaction");
        }
        TsoMetrics::incr(&self.metrics.timestamps_issued);

        self.open_batch()?.add_timestamp(start, channel, ctx);
        Ok(())
    }

    /// Decides a commit.
    pub fn process_commit_request(
        &mut self,
        start: Timestamp,
        write_set: &[CellId],
        channel: ClientChannel,
        ctx: MonitoringContext,
    ) -> Result<()> {
        self.check_issued(start)?;

        // A duplicate of a commit already decided: replay it.
        if let Some(decision) = self.decisions.get(&start).copied() {
            TsoMetrics::incr(&self.metrics.commit_retries);
            self.open_batch()?
                .add_commit_retry(start, RetryState::Resolved(Some(decision)), channel, ctx);
            return Ok(());
        }

        // Expired, begun by a previous incarnation, or decided long ago: only
        // the commit log can answer, and no new decision may be made.
        if !self.open.finish(start) {
            debug!(%start, "commit for a transaction that is not open");
            self.open_batch()?
                .add_commit_retry(start, RetryState::Unresolved, channel, ctx);
            return Ok(());
        }

        let decision = if self.conflicts.conflicts(start, write_set) {
            TsoMetrics::incr(&self.metrics.conflict_aborts);
            Decision::Aborted
        } else {
            let commit = self.oracle.next()?;
            let evicted = self.conflicts.record(commit, write_set);
            if evicted > 0 {
                TsoMetrics::add(&self.metrics.conflict_map_evictions, evicted as u64);
                warn!(
                    evicted,
                    floor = %self.conflicts.floor(),
                    "conflict map over capacity, evicted oldest entries"
                );
            }
            TsoMetrics::incr(&self.metrics.commits);
            Decision::Committed(commit)
        };
        self.decisions.put(start, decision);

        let candidate = self.open.oldest();
        let batch = self.open_batch()?;
        match decision {
            Decision::Committed(commit) => batch.add_commit(start, commit, channel, ctx, candidate),
            Decision::Aborted => batch.add_abort(start, channel, ctx, candidate),
        }
        Ok(())
    }

    /// Re-answers a commit already submitted, without re-deciding it.
    ///
    /// A retry for a transaction that is still open means the original commit
    /// was lost before reaching the oracle; the transaction is aborted so the
    /// answer can never change afterwards.
    pub fn process_commit_retry(
        &mut self,
        start: Timestamp,
        channel: ClientChannel,
        ctx: MonitoringContext,
    ) -> Result<()> {
        self.check_issued(start)?;
        TsoMetrics::incr(&self.metrics.commit_retries);

        let state = if let Some(decision) = self.decisions.get(&start).copied() {
            RetryState::Resolved(Some(decision))
        } else if self.open.finish(start) {
            self.decisions.put(start, Decision::Aborted);
            RetryState::Resolved(Some(Decision::Aborted))
        } else {
            RetryState::Unresolved
        };

        self.open_batch()?.add_commit_retry(start, state, channel, ctx);
        Ok(())
    }

    /// Records a client abort. The conflict map is never touched, since the
    /// transaction's writes were never recorded as committed.
    pub fn process_abort(
        &mut self,
        start: Timestamp,
        channel: ClientChannel,
        ctx: MonitoringContext,
    ) -> Result<()> {
        self.check_issued(start)?;
        TsoMetrics::incr(&self.metrics.client_aborts);

        if self.open.finish(start) {
            self.decisions.put(start, Decision::Aborted);
        }
        self.open_batch()?.add_abort_ack(start, channel, ctx);
        Ok(())
    }

    /// A start timestamp above the last one issued was never handed out.
    fn check_issued(&self, start: Timestamp) -> Result<()> {
        if start > self.oracle.last() {
            return Err(panicker::raise(
                self.panicker.as_ref(),
                format!(
                    "start timestamp {start} is beyond the last issued timestamp {}",
                    self.oracle.last()
                ),
            ));
        }
        Ok(())
    }

    fn open_batch(&mut self) -> Result<&mut Batch> {
        self.batch.as_mut().ok_or(Error::ShutDown("request processor"))
    }

    /// True if the open batch reached its size boundary.
    pub fn batch_is_full(&self) -> bool {
        self.batch.as_ref().is_some_and(Batch::is_full)
    }

    pub fn batch_is_empty(&self) -> bool {
        self.batch.as_ref().map_or(true, Batch::is_empty)
    }

    /// Closes the open batch, hands it to persistence, and borrows the next
    /// one. Waits while the pool is exhausted.
    pub async fn flush(&mut self) -> Result<()> {
        if self.batch_is_empty() {
            return Ok(());
        }
        self.close_batch()?;
        self.batch = Some(self.pool.borrow().await);
        Ok(())
    }

    /// Seals and submits the open batch without borrowing a new one.
    fn close_batch(&mut self) -> Result<()> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };
        let seq = self.next_seq;
        self.next_seq = seq.next();

        let entries = batch.len();
        TsoMetrics::incr(&self.metrics.batches_closed);
        TsoMetrics::add(&self.metrics.entries_closed, entries as u64);
        debug!(%seq, entries, "batch closed");
        self.persistence.submit(ClosedBatch::new(seq, batch))?;

        // Nothing committed below the oldest open transaction can conflict
        // again. With none open, nothing recorded so far can.
        let threshold = self
            .open
            .oldest()
            .unwrap_or_else(|| self.oracle.last().saturating_add(1));
        let pruned = self.conflicts.prune_below(threshold);
        if pruned > 0 {
            debug!(pruned, threshold = %threshold, "pruned conflict map");
        }
        Ok(())
    }

    /// Submits any remaining entries and gives the empty batch back.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.batch_is_empty() {
            if let Some(batch) = self.batch.take() {
                self.pool.release(batch);
            }
            return Ok(());
        }
        self.close_batch()
    }

    /// The sequence number the next closed batch will get.
    pub fn next_seq(&self) -> BatchSeq {
        self.next_seq
    }

    pub fn last_timestamp(&self) -> Timestamp {
        self.oracle.last()
    }
}

impl std::fmt::Debug for RequestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProcessor")
            .field("oracle", &self.oracle)
            .field("next_seq", &self.next_seq)
            .field("open_transactions", &self.open.len())
            .field("conflict_map_len", &self.conflicts.len())
            .finish()
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Messages accepted by the sequencing loop.
#[derive(Debug)]
pub enum ProcessorMessage {
    Request(Request),
    /// Flush the open batch and stop.
    Shutdown,
}

/// Submits requests to the sequencing thread.
#[derive(Debug, Clone)]
pub struct RequestProcessorHandle {
    tx: mpsc::Sender<ProcessorMessage>,
}

impl RequestProcessorHandle {
    /// Queues a request. Waits while the request queue is full.
    pub async fn submit(&self, request: Request) -> Result<()> {
        self.tx
            .send(ProcessorMessage::Request(request))
            .await
            .map_err(|_| Error::ShutDown("request processor"))
    }

    /// Asks the loop to flush and stop.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(ProcessorMessage::Shutdown)
            .await
            .map_err(|_| Error::ShutDown("request processor"))
    }
}

// =============================================================================
// Processor Loop
// =============================================================================

/// Runs the sequencing loop until shutdown or until every handle is dropped.
pub async fn run_request_processor(
    mut processor: RequestProcessor,
    mut rx: mpsc::Receiver<ProcessorMessage>,
    batch_timeout: Duration,
) {
    let mut batch_start: Option<Instant> = None;

    loop {
        if let Err(e) = processor.oracle.maintain().await {
            let _ = panicker::raise(
                processor.panicker.as_ref(),
                format!("timestamp reservation failed: {e}"),
            );
        }

        let wait = match batch_start {
            None => IDLE_WAIT,
            Some(started) => batch_timeout.saturating_sub(started.elapsed()),
        };

        match timeout(wait, rx.recv()).await {
            Ok(Some(ProcessorMessage::Request(request))) => {
                if batch_start.is_none() {
                    batch_start = Some(Instant::now());
                }

                let channel = request.channel().clone();
                if let Err(e) = processor.process(request) {
                    error!(error = %e, connection = %channel.id(), "request failed");
                    channel.send(Response::Error {
                        start: None,
                        reason: e.to_string(),
                    });
                }

                if processor.batch_is_full() {
                    flush(&mut processor).await;
                    batch_start = None;
                }
            }
            Ok(Some(ProcessorMessage::Shutdown)) | Ok(None) => {
                if let Err(e) = processor.shutdown() {
                    error!(error = %e, "failed to submit final batch");
                }
                info!(next_seq = %processor.next_seq(), "request processor stopped");
                break;
            }
            Err(_) => {
                flush(&mut processor).await;
                batch_start = None;
            }
        }
    }
}

async fn flush(processor: &mut RequestProcessor) {
    if let Err(e) = processor.flush().await {
        let _ = panicker::raise(
            processor.panicker.as_ref(),
            format!("batch hand-off failed: {e}"),
        );
    }
}

/// Spawns the sequencing loop on a dedicated thread.
pub fn spawn_request_processor(
    processor: RequestProcessor,
    config: &TsoConfig,
) -> Result<(RequestProcessorHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(config.request_channel_size);
    let batch_timeout = config.batch_timeout;

    let thread = std::thread::Builder::new()
        .name("tso-request".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create request processor runtime");

            rt.block_on(run_request_processor(processor, rx, batch_timeout));
        })
        .map_err(|e| Error::Fatal(format!("failed to spawn request processor: {e}")))?;

    Ok((RequestProcessorHandle { tx }, thread))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchEntry;
    use crate::panicker::RecordingPanicker;
    use crate::timestamp::MemoryTimestampStorage;
    use crate::types::ConnectionId;
    use std::sync::mpsc as std_mpsc;

    fn ts(v: u64) -> Timestamp {
        Timestamp::from_raw(v)
    }

    fn cell(v: u64) -> CellId {
        CellId::from_raw(v)
    }

    struct Harness {
        processor: RequestProcessor,
        submitted: std_mpsc::Receiver<ClosedBatch>,
        panicker: RecordingPanicker,
        pool: BatchPool,
        channel: ClientChannel,
    }

    impl Harness {
        fn new(config: TsoConfig) -> Self {
            Self::with_storage(config, MemoryTimestampStorage::new())
        }

        fn with_storage(config: TsoConfig, storage: MemoryTimestampStorage) -> Self {
            let oracle = TimestampOracle::open(
                Box::new(storage),
                ts(config.initial_timestamp),
                config.timestamp_reservation,
            )
            .unwrap();
            let pool = BatchPool::new(config.num_concurrent_writers, config.batch_max_size);
            let (tx, submitted) = std_mpsc::channel();
            let panicker = RecordingPanicker::new();
            let processor = RequestProcessor::new(
                oracle,
                &config,
                pool.clone(),
                PersistenceHandle::from_sender(tx),
                Arc::new(panicker.clone()),
                Arc::new(TsoMetrics::new()),
            )
            .unwrap();
            Self {
                processor,
                submitted,
                panicker,
                pool,
                channel: ClientChannel::pair(ConnectionId::from_raw(1)).0,
            }
        }

        fn begin(&mut self) -> Timestamp {
            self.processor
                .process_timestamp_request(self.channel.clone(), MonitoringContext::new())
                .unwrap();
            self.processor.last_timestamp()
        }

        fn commit(&mut self, start: Timestamp, cells: &[u64]) {
            let write_set: Vec<CellId> = cells.iter().copied().map(cell).collect();
            self.processor
                .process_commit_request(start, &write_set, self.channel.clone(), MonitoringContext::new())
                .unwrap();
        }

        /// Closes the open batch and returns it.
        fn close(&mut self) -> ClosedBatch {
            self.processor.close_batch().unwrap();
            let closed = self.submitted.try_recv().unwrap();
            self.processor.batch = self.pool.try_borrow();
            closed
        }
    }

    fn config() -> TsoConfig {
        TsoConfig {
            num_concurrent_writers: 3,
            batch_max_size: 100,
            timestamp_reservation: 1000,
            ..TsoConfig::default()
        }
    }

    fn summarize(batch: &ClosedBatch) -> Vec<String> {
        batch
            .entries()
            .iter()
            .map(|entry| match entry {
                BatchEntry::Timestamp { start, .. } => format!("ts {start}"),
                BatchEntry::Commit {
                    start,
                    commit,
                    low_watermark,
                    ..
                } => format!("commit {start}->{commit} lwm {low_watermark:?}"),
                BatchEntry::Abort { start, .. } => format!("abort {start}"),
                BatchEntry::AbortAck { start, .. } => format!("ack {start}"),
                BatchEntry::CommitRetry { start, state, .. } => format!("retry {start} {state:?}"),
            })
            .collect()
    }

    #[test]
    fn test_timestamps_are_strictly_increasing() {
        let mut h = Harness::new(config());
        let a = h.begin();
        let b = h.begin();
        let c = h.begin();
        assert!(a < b && b < c);
        assert_eq!(a, ts(1));
    }

    #[test]
    fn test_write_write_conflict_aborts() {
        let mut h = Harness::new(config());
        let t1 = h.begin(); // 1
        let t2 = h.begin(); // 2

        h.commit(t1, &[10, 11]); // commit ts 3
        h.commit(t2, &[11]); // overlaps, committed after t2 began

        let closed = h.close();
        assert_eq!(
            summarize(&closed),
            vec![
                "ts 1".to_string(),
                "ts 2".to_string(),
                "commit 1->3 lwm Some(Timestamp(2))".to_string(),
                "abort 2".to_string(),
            ]
        );
        assert_eq!(h.processor.metrics.snapshot().conflict_aborts, 1);
    }

    #[test]
    fn test_disjoint_and_later_writers_commit() {
        let mut h = Harness::new(config());
        let t1 = h.begin();
        h.commit(t1, &[1]); // commit 2
        let t3 = h.begin(); // 3, began after the commit
        let t4 = h.begin();
        h.commit(t3, &[1]);
        h.commit(t4, &[2]);

        let commits = h
            .close()
            .entries()
            .iter()
            .filter(|e| matches!(e, BatchEntry::Commit { .. }))
            .count();
        assert_eq!(commits, 3);
    }

    #[test]
    fn test_low_watermark_candidate_is_oldest_open() {
        let mut h = Harness::new(config());
        let t1 = h.begin();
        let t2 = h.begin();
        let t3 = h.begin();

        h.commit(t2, &[1]);
        h.commit(t1, &[2]);
        h.commit(t3, &[3]);

        let candidates: Vec<_> = h
            .close()
            .entries()
            .iter()
            .filter_map(|e| match e {
                BatchEntry::Commit { low_watermark, .. } => Some(*low_watermark),
                _ => None,
            })
            .collect();
        assert_eq!(candidates, vec![Some(t1), Some(t3), None]);
    }

    #[test]
    fn test_commit_retry_replays_without_redeciding() {
        let mut h = Harness::new(config());
        let t1 = h.begin();
        h.commit(t1, &[1]);
        let committed_at = h.processor.last_timestamp();
        let tracked = h.processor.conflicts.len();
        assert_eq!(h.processor.conflicts.committed(cell(1)), Some(committed_at));

        h.processor
            .process_commit_retry(t1, h.channel.clone(), MonitoringContext::new())
            .unwrap();
        // A duplicate commit is also a replay, even with another write set.
        h.commit(t1, &[1, 2]);

        assert_eq!(h.processor.last_timestamp(), committed_at, "no timestamp reallocated");
        assert_eq!(h.processor.conflicts.len(), tracked);
        assert_eq!(h.processor.conflicts.committed(cell(1)), Some(committed_at));
        assert_eq!(h.processor.conflicts.committed(cell(2)), None);
        let closed = h.close();
        let summary = summarize(&closed);
        let replay = format!("retry {t1} Resolved(Some(Committed(Timestamp({}))))", committed_at.as_raw());
        assert_eq!(summary[2], replay);
        assert_eq!(summary[3], replay);
    }

    #[test]
    fn test_retry_of_open_transaction_aborts_it() {
        let mut h = Harness::new(config());
        let t1 = h.begin();
        h.processor
            .process_commit_retry(t1, h.channel.clone(), MonitoringContext::new())
            .unwrap();
        // The late commit replays the abort.
        h.commit(t1, &[1]);

        let summary = summarize(&h.close());
        assert_eq!(summary[1], format!("retry {t1} Resolved(Some(Aborted))"));
        assert_eq!(summary[2], format!("retry {t1} Resolved(Some(Aborted))"));
    }

    #[test]
    fn test_abort_does_not_touch_conflict_map() {
        let mut h = Harness::new(config());
        let t1 = h.begin();
        let t2 = h.begin();
        h.processor
            .process_abort(t1, h.channel.clone(), MonitoringContext::new())
            .unwrap();
        h.commit(t2, &[1]);

        let summary = summarize(&h.close());
        assert_eq!(summary[2], format!("ack {t1}"));
        assert!(summary[3].starts_with(&format!("commit {t2}->")));
    }

    #[test]
    fn test_unknown_transaction_is_resolved_by_log() {
        let storage = MemoryTimestampStorage::new();
        {
            let mut h = Harness::with_storage(config(), storage.clone());
            h.begin();
        }

        // Restart: transaction 1 belongs to the previous incarnation.
        let mut h = Harness::with_storage(config(), storage);
        h.begin();
        h.commit(ts(1), &[1]);

        let summary = summarize(&h.close());
        assert_eq!(summary[1], "retry 1 Unresolved");
    }

    #[test]
    fn test_out_of_range_timestamp_is_fatal() {
        let mut h = Harness::new(config());
        h.begin();

        let err = h
            .processor
            .process_commit_request(ts(500), &[cell(1)], h.channel.clone(), MonitoringContext::new())
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(h.panicker.count(), 1);
    }

    #[test]
    fn test_batch_sequence_numbers_increase() {
        let mut h = Harness::new(config());
        h.begin();
        let first = h.close();
        h.begin();
        let second = h.close();

        assert_eq!(first.seq(), BatchSeq::FIRST);
        assert_eq!(second.seq(), BatchSeq::from_raw(1));
    }

    #[test]
    fn test_pruning_after_hand_off() {
        let mut h = Harness::new(config());
        let t1 = h.begin();
        h.commit(t1, &[1, 2, 3]);
        assert_eq!(h.processor.conflicts.len(), 3);

        h.close();
        // Nothing is open, so every recorded commit is below the threshold.
        assert!(h.processor.conflicts.is_empty());
    }

    #[test]
    fn test_expired_transaction_cannot_commit() {
        let mut h = Harness::new(TsoConfig {
            max_open_transactions: 2,
            ..config()
        });
        let t1 = h.begin();
        h.begin();
        h.begin(); // expires t1
        let last = h.processor.last_timestamp();

        h.commit(t1, &[1]);
        // Left to the commit log; nothing is decided here.
        assert_eq!(h.processor.last_timestamp(), last);
        assert_eq!(h.processor.conflicts.committed(cell(1)), None);
        assert!(!h.processor.decisions.contains(&t1));
        let summary = summarize(&h.close());
        assert_eq!(summary[3], format!("retry {t1} Unresolved"));
        assert_eq!(h.processor.metrics.snapshot().expired_transactions, 1);
    }

    #[tokio::test]
    async fn test_flush_waits_for_pool() {
        let mut h = Harness::new(TsoConfig {
            num_concurrent_writers: 1,
            ..config()
        });
        h.begin();

        let pool = h.pool.clone();
        let submitted = h.submitted;
        let mut processor = h.processor;
        let flush = tokio::spawn(async move {
            processor.flush().await.unwrap();
            processor
        });

        // The only batch is in flight until it is released.
        let closed = tokio::task::spawn_blocking(move || submitted.recv().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flush.is_finished());

        pool.release(closed.into_batch());
        let processor = flush.await.unwrap();
        assert!(processor.batch_is_empty());
        assert_eq!(processor.next_seq(), BatchSeq::from_raw(1));
    }
}
