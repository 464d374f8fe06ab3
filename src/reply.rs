//! # Reply Stage
//!
//! Turns persisted batches back into client replies, strictly in
//! batch-sequence order, and drives low-watermark persistence.
//!
//! ## Reordering
//!
//! Persistence workers finish in any order. The reply processor keeps a
//! cursor, `next_to_handle`, and a reorder buffer keyed by sequence number:
//!
//! ```text
//!   event seq > next  ──► WAITING: held in the reorder buffer
//!   event seq == next ──► READY:   handled now, then every contiguous
//!                                  buffered batch after it
//!   event seq < next  ──► fatal:   the batch was already handled
//! ```
//!
//! At most `capacity` batches exist outside the pool, so the buffer never
//! holds more than that.
//!
//! ## Handling a Batch
//!
//! Entries are replied to in the order the sequencing stage recorded them.
//! Once the last reply is sent, the batch is cleared and released to the pool,
//! and the cursor moves on.
//!
//! ## Low Watermark Rule
//!
//! Each commit outcome may carry a low-watermark candidate. A candidate is
//! passed to the [`LowWatermarkWriter`] only if it is strictly greater than
//! every candidate passed before, across all batches. Lower or equal ones are
//! suppressed, so the persisted value only ever increases and each value is
//! written at most once.
//!
//! ## In-Doubt Decisions
//!
//! Under [`DurabilityFailurePolicy::ReplyError`] a failed batch still holds
//! decisions the sequencing stage has made and cached, but none of them is in
//! the commit log. A retry may yet make such a commit durable, so its
//! transaction is not finalized. The start timestamps of failed commits stay
//! in doubt until a durable batch settles them, and no candidate may pass the
//! oldest one:
//!
//! ```text
//!   persisted = max(previous, min(candidate, oldest in-doubt start))
//! ```
//!
//! [`DurabilityFailurePolicy::ReplyError`]: crate::config::DurabilityFailurePolicy::ReplyError

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::batch::{BatchEntry, BatchPool, ClosedBatch, RetryState};
use crate::commit_log::{CommitRecord, Decision};
use crate::error::{Error, Result};
use crate::metrics::TsoMetrics;
use crate::panicker::{self, Panicker};
use crate::persistence::{PersistEvent, PersistStatus};
use crate::types::{BatchSeq, Response, Timestamp};
use crate::watermark::LowWatermarkWriter;

// =============================================================================
// ReplyProcessor
// =============================================================================

/// The single reply authority.
pub struct ReplyProcessor {
    next_to_handle: BatchSeq,
    future_events: BTreeMap<BatchSeq, PersistEvent>,
    low_watermark: Option<Timestamp>,
    /// Starts whose decision was replied with an error and is not yet durable.
    in_doubt: BTreeSet<Timestamp>,
    writer: LowWatermarkWriter,
    pool: BatchPool,
    panicker: Arc<dyn Panicker>,
    metrics: Arc<TsoMetrics>,
}

impl ReplyProcessor {
    /// Creates a processor expecting [`BatchSeq::FIRST`] next.
    ///
    /// `low_watermark` is the value already persisted, if any.
    pub fn new(
        writer: LowWatermarkWriter,
        pool: BatchPool,
        panicker: Arc<dyn Panicker>,
        metrics: Arc<TsoMetrics>,
        low_watermark: Option<Timestamp>,
    ) -> Self {
        Self {
            next_to_handle: BatchSeq::FIRST,
            future_events: BTreeMap::new(),
            low_watermark,
            in_doubt: BTreeSet::new(),
            writer,
            pool,
            panicker,
            metrics,
        }
    }

    /// The sequence number of the next batch to deliver.
    pub fn next_to_handle(&self) -> BatchSeq {
        self.next_to_handle
    }

    /// Number of batches waiting in the reorder buffer.
    pub fn buffered(&self) -> usize {
        self.future_events.len()
    }

    /// The highest low watermark passed to the writer.
    pub fn low_watermark(&self) -> Option<Timestamp> {
        self.low_watermark
    }

    /// The oldest start whose decision failed to persist and has not been
    /// settled since.
    pub fn oldest_in_doubt(&self) -> Option<Timestamp> {
        self.in_doubt.first().copied()
    }

    /// Accepts a completion event.
    ///
    /// A malformed event is raised through the panicker and returned as
    /// [`Error::Fatal`]; the processor's state is left untouched and the batch
    /// is not returned to the pool.
    pub fn on_event(&mut self, event: PersistEvent) -> Result<()> {
        let seq = event.batch.seq();
        self.validate(&event)?;

        if seq > self.next_to_handle {
            debug!(%seq, next = %self.next_to_handle, "batch persisted ahead of its turn");
            self.future_events.insert(seq, event);
            TsoMetrics::incr(&self.metrics.batches_buffered);
            TsoMetrics::set_max(&self.metrics.max_reorder_depth, self.future_events.len() as u64);
            return Ok(());
        }

        self.handle(event);
        while let Some(event) = self.future_events.remove(&self.next_to_handle) {
            self.handle(event);
        }
        Ok(())
    }

    fn validate(&self, event: &PersistEvent) -> Result<()> {
        let seq = event.batch.seq();
        if seq < self.next_to_handle {
            return Err(panicker::raise(
                self.panicker.as_ref(),
                format!("batch {seq} arrived after batch {} was due", self.next_to_handle),
            ));
        }
        if self.future_events.contains_key(&seq) {
            return Err(panicker::raise(
                self.panicker.as_ref(),
                format!("batch {seq} persisted twice"),
            ));
        }
        if event.status == PersistStatus::Durable && !event.batch.unresolved_retries().is_empty() {
            return Err(panicker::raise(
                self.panicker.as_ref(),
                format!("batch {seq} reached the reply stage with unresolved commit retries"),
            ));
        }
        Ok(())
    }

    fn handle(&mut self, event: PersistEvent) {
        let PersistEvent { batch, status } = event;
        let seq = batch.seq();
        let entries = batch.len();

        match &status {
            PersistStatus::Durable => {
                for entry in batch.entries() {
                    if settles(entry) && self.in_doubt.remove(&entry.start()) {
                        debug!(start = %entry.start(), "in-doubt decision is now durable");
                    }
                }
                for entry in batch.entries() {
                    let response = self.response_for(entry);
                    self.deliver(entry, response);
                }
            }
            PersistStatus::Failed(reason) => {
                warn!(%seq, %reason, "replying with errors for a batch that failed to persist");
                for entry in batch.entries() {
                    // An abort that never reached the log reads back as
                    // unknown, which answers the same; only commits can flip.
                    if let Some(CommitRecord {
                        start,
                        decision: Decision::Committed(_),
                    }) = entry.decision()
                    {
                        self.in_doubt.insert(start);
                    }
                    let response = Response::Error {
                        start: Some(entry.start()),
                        reason: reason.clone(),
                    };
                    self.deliver(entry, response);
                }
            }
        }

        self.pool.release(batch.into_batch());
        self.next_to_handle = seq.next();
        TsoMetrics::incr(&self.metrics.batches_replied);
        debug!(%seq, entries, "batch replied");
    }

    fn response_for(&mut self, entry: &BatchEntry) -> Response {
        match entry {
            BatchEntry::Timestamp { start, .. } => Response::Timestamp { start: *start },
            BatchEntry::Commit {
                start,
                commit,
                low_watermark,
                ..
            } => Response::Committed {
                start: *start,
                commit: *commit,
                low_watermark: self.consider_low_watermark(*low_watermark),
            },
            BatchEntry::Abort {
                start,
                low_watermark,
                ..
            } => {
                self.consider_low_watermark(*low_watermark);
                Response::Aborted { start: *start }
            }
            BatchEntry::AbortAck { start, .. } => Response::AbortAcknowledged { start: *start },
            BatchEntry::CommitRetry { start, state, .. } => match state {
                RetryState::Resolved(Some(Decision::Committed(commit))) => Response::Committed {
                    start: *start,
                    commit: *commit,
                    low_watermark: None,
                },
                RetryState::Resolved(Some(Decision::Aborted)) | RetryState::Resolved(None) => {
                    Response::Aborted { start: *start }
                }
                // Rejected by validate() for durable batches.
                RetryState::Unresolved => Response::Error {
                    start: Some(*start),
                    reason: "commit retry was never resolved".to_string(),
                },
            },
        }
    }

    /// Persists `candidate` if it beats every earlier one. Returns the value
    /// passed to the writer, if any.
    fn consider_low_watermark(&mut self, candidate: Option<Timestamp>) -> Option<Timestamp> {
        let mut candidate = candidate?;
        if let Some(oldest) = self.oldest_in_doubt() {
            if oldest < candidate {
                debug!(%candidate, %oldest, "low watermark held back by an in-doubt decision");
                candidate = oldest;
            }
        }
        if self.low_watermark.is_some_and(|current| candidate <= current) {
            TsoMetrics::incr(&self.metrics.low_watermark_suppressed);
            return None;
        }

        self.low_watermark = Some(candidate);
        // Fire and forget: the writer logs its own failures.
        drop(self.writer.persist_low_watermark(candidate));
        TsoMetrics::incr(&self.metrics.low_watermark_persists);
        TsoMetrics::set(&self.metrics.last_low_watermark, candidate.as_raw());
        Some(candidate)
    }

    fn deliver(&self, entry: &BatchEntry, response: Response) {
        TsoMetrics::add_duration(&self.metrics.request_micros, entry.ctx().elapsed());

        let channel = entry.channel();
        if !channel.send(response) {
            TsoMetrics::incr(&self.metrics.replies_dropped);
            warn!(connection = %channel.id(), start = %entry.start(), "client disconnected before reply");
        }
    }

    /// Stops the low-watermark writer after its queued writes complete.
    ///
    /// Batches still in the reorder buffer were never replied to; they are
    /// logged and dropped.
    pub fn shutdown(self) {
        if !self.future_events.is_empty() {
            error!(
                buffered = self.future_events.len(),
                next = %self.next_to_handle,
                "reply processor stopped with undelivered batches"
            );
        }
        self.writer.shutdown();
        info!(next = %self.next_to_handle, "reply processor stopped");
    }
}

/// True if a durable batch carrying `entry` fixes its transaction's outcome
/// for good.
///
/// Abort acknowledgements are left out: an abort never overrides a commit in
/// the log, so one cannot settle a commit that is still in doubt.
fn settles(entry: &BatchEntry) -> bool {
    match entry {
        BatchEntry::Commit { .. } | BatchEntry::Abort { .. } => true,
        BatchEntry::CommitRetry { state, .. } => matches!(state, RetryState::Resolved(_)),
        BatchEntry::Timestamp { .. } | BatchEntry::AbortAck { .. } => false,
    }
}

impl std::fmt::Debug for ReplyProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyProcessor")
            .field("next_to_handle", &self.next_to_handle)
            .field("buffered", &self.future_events.len())
            .field("low_watermark", &self.low_watermark)
            .finish()
    }
}

// =============================================================================
// Reply Thread
// =============================================================================

/// Runs the reply processor on a dedicated thread until `events` closes.
pub fn spawn_reply_processor(
    mut processor: ReplyProcessor,
    events: std_mpsc::Receiver<PersistEvent>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("tso-reply".to_string())
        .spawn(move || {
            while let Ok(event) = events.recv() {
                // Fatal conditions were already raised through the panicker.
                if let Err(e) = processor.on_event(event) {
                    error!(error = %e, "dropping malformed completion event");
                }
            }
            processor.shutdown();
        })
        .map_err(|e| Error::Fatal(format!("failed to spawn reply processor: {e}")))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::panicker::RecordingPanicker;
    use crate::types::{ClientChannel, ConnectionId, MonitoringContext};
    use crate::watermark::MemoryLowWatermarkStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    const POOL_SIZE: usize = 3;

    fn ts(v: u64) -> Timestamp {
        Timestamp::from_raw(v)
    }

    struct Harness {
        processor: ReplyProcessor,
        pool: BatchPool,
        panicker: RecordingPanicker,
        store: MemoryLowWatermarkStore,
        channel: ClientChannel,
        replies: UnboundedReceiver<Response>,
    }

    impl Harness {
        fn new() -> Self {
            let pool = BatchPool::new(POOL_SIZE, 100);
            let panicker = RecordingPanicker::new();
            let store = MemoryLowWatermarkStore::new();
            let writer = LowWatermarkWriter::spawn(Box::new(store.clone()), None).unwrap();
            let processor = ReplyProcessor::new(
                writer,
                pool.clone(),
                Arc::new(panicker.clone()),
                Arc::new(TsoMetrics::new()),
                None,
            );
            let (channel, replies) = ClientChannel::pair(ConnectionId::from_raw(1));
            Self {
                processor,
                pool,
                panicker,
                store,
                channel,
                replies,
            }
        }

        fn batch(&self) -> Batch {
            self.pool.try_borrow().expect("pool exhausted")
        }

        fn durable(&self, seq: u64, batch: Batch) -> PersistEvent {
            PersistEvent::durable(ClosedBatch::new(BatchSeq::from_raw(seq), batch))
        }

        fn drain(&mut self) -> Vec<Response> {
            let mut out = Vec::new();
            while let Ok(response) = self.replies.try_recv() {
                out.push(response);
            }
            out
        }

        /// Stops the writer so the store history is complete.
        fn finish(self) -> Vec<Timestamp> {
            self.processor.shutdown();
            self.store.history()
        }
    }

    fn ctx() -> MonitoringContext {
        MonitoringContext::new()
    }

    #[test]
    fn test_empty_batch_is_handled() {
        let mut h = Harness::new();
        let batch = h.batch();
        assert_eq!(h.pool.num_active(), 1);

        let event = h.durable(0, batch);
        h.processor.on_event(event).unwrap();

        assert_eq!(h.processor.next_to_handle(), BatchSeq::from_raw(1));
        assert_eq!(h.processor.buffered(), 0);
        assert_eq!(h.pool.num_active(), 0);
        assert_eq!(h.pool.num_idle(), POOL_SIZE);
    }

    #[test]
    fn test_single_batch_in_order() {
        let mut h = Harness::new();
        let mut batch = h.batch();
        batch.add_timestamp(ts(5), h.channel.clone(), ctx());
        batch.add_commit(ts(2), ts(3), h.channel.clone(), ctx(), None);

        let event = h.durable(0, batch);
        h.processor.on_event(event).unwrap();

        assert_eq!(h.processor.next_to_handle(), BatchSeq::from_raw(1));
        assert_eq!(h.processor.buffered(), 0);
        assert_eq!(
            h.drain(),
            vec![
                Response::Timestamp { start: ts(5) },
                Response::Committed {
                    start: ts(2),
                    commit: ts(3),
                    low_watermark: None
                },
            ]
        );
        assert_eq!(h.pool.num_active(), 0);
    }

    #[test]
    fn test_out_of_order_arrival() {
        let mut h = Harness::new();
        let mut batches: Vec<Batch> = (0..3).map(|_| h.batch()).collect();
        for (seq, batch) in batches.iter_mut().enumerate() {
            batch.add_timestamp(ts(seq as u64), h.channel.clone(), ctx());
        }
        assert_eq!(h.pool.num_active(), 3);

        let b2 = batches.pop().unwrap();
        let b1 = batches.pop().unwrap();
        let b0 = batches.pop().unwrap();

        let event = h.durable(2, b2);
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.next_to_handle(), BatchSeq::FIRST);
        assert_eq!(h.processor.buffered(), 1);

        let event = h.durable(1, b1);
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.next_to_handle(), BatchSeq::FIRST);
        assert_eq!(h.processor.buffered(), 2);
        assert!(h.drain().is_empty(), "nothing may be delivered before batch 0");
        assert_eq!(h.pool.num_active(), 3);

        let event = h.durable(0, b0);
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.next_to_handle(), BatchSeq::from_raw(3));
        assert_eq!(h.processor.buffered(), 0);
        assert_eq!(
            h.drain(),
            vec![
                Response::Timestamp { start: ts(0) },
                Response::Timestamp { start: ts(1) },
                Response::Timestamp { start: ts(2) },
            ]
        );
        assert_eq!(h.pool.num_active(), 0);
        assert!(!h.panicker.has_panicked());
    }

    #[test]
    fn test_unresolved_retry_is_fatal() {
        let mut h = Harness::new();
        let mut batch = h.batch();
        batch.add_commit_retry(ts(1), RetryState::Unresolved, h.channel.clone(), ctx());

        let event = h.durable(0, batch);
        let err = h.processor.on_event(event).unwrap_err();

        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(h.panicker.count(), 1);
        assert_eq!(h.processor.next_to_handle(), BatchSeq::FIRST);
        assert_eq!(h.processor.buffered(), 0);
        assert_eq!(h.pool.num_active(), 1);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_stale_sequence_is_fatal() {
        let mut h = Harness::new();
        let event = h.durable(0, h.batch());
        h.processor.on_event(event).unwrap();

        let event = h.durable(0, h.batch());
        let err = h.processor.on_event(event).unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert!(h.panicker.reasons()[0].contains("arrived after"));
        assert_eq!(h.processor.next_to_handle(), BatchSeq::from_raw(1));
    }

    #[test]
    fn test_duplicate_buffered_sequence_is_fatal() {
        let mut h = Harness::new();
        let event = h.durable(1, h.batch());
        h.processor.on_event(event).unwrap();

        let event = h.durable(1, h.batch());
        assert!(h.processor.on_event(event).is_err());
        assert_eq!(h.processor.buffered(), 1);
        assert_eq!(h.panicker.count(), 1);
    }

    #[test]
    fn test_low_watermark_suppression() {
        let mut h = Harness::new();
        let mut batch = h.batch();
        let candidates = [Some(100), Some(50), None, Some(100), Some(150)];
        for (i, candidate) in candidates.iter().enumerate() {
            let start = ts(i as u64 * 2 + 1);
            let commit = ts(i as u64 * 2 + 2);
            batch.add_commit(start, commit, h.channel.clone(), ctx(), candidate.map(ts));
        }

        let event = h.durable(0, batch);
        h.processor.on_event(event).unwrap();

        let attached: Vec<Option<Timestamp>> = h
            .drain()
            .into_iter()
            .map(|response| match response {
                Response::Committed { low_watermark, .. } => low_watermark,
                other => panic!("unexpected response {other:?}"),
            })
            .collect();
        assert_eq!(attached, vec![Some(ts(100)), None, None, None, Some(ts(150))]);
        assert_eq!(h.processor.low_watermark(), Some(ts(150)));
        assert_eq!(h.finish(), vec![ts(100), ts(150)]);
    }

    #[test]
    fn test_low_watermark_suppressed_across_batches() {
        let mut h = Harness::new();

        let mut first = h.batch();
        first.add_commit(ts(1), ts(2), h.channel.clone(), ctx(), Some(ts(40)));
        let mut second = h.batch();
        second.add_abort(ts(3), h.channel.clone(), ctx(), Some(ts(30)));
        second.add_commit(ts(5), ts(6), h.channel.clone(), ctx(), Some(ts(45)));

        // Completion order is reversed; delivery order is not.
        let event = h.durable(1, second);
        h.processor.on_event(event).unwrap();
        let event = h.durable(0, first);
        h.processor.on_event(event).unwrap();

        assert_eq!(h.finish(), vec![ts(40), ts(45)]);
    }

    #[test]
    fn test_failed_batch_replies_errors_in_order() {
        let mut h = Harness::new();
        let mut failed = h.batch();
        failed.add_commit(ts(1), ts(2), h.channel.clone(), ctx(), Some(ts(1)));
        failed.add_timestamp(ts(3), h.channel.clone(), ctx());
        let mut ok = h.batch();
        ok.add_timestamp(ts(4), h.channel.clone(), ctx());

        let event = h.durable(1, ok);
        h.processor.on_event(event).unwrap();
        let event = PersistEvent::failed(ClosedBatch::new(BatchSeq::FIRST, failed), "disk full");
        h.processor.on_event(event).unwrap();

        assert_eq!(
            h.drain(),
            vec![
                Response::Error {
                    start: Some(ts(1)),
                    reason: "disk full".to_string()
                },
                Response::Error {
                    start: Some(ts(3)),
                    reason: "disk full".to_string()
                },
                Response::Timestamp { start: ts(4) },
            ]
        );
        assert_eq!(h.pool.num_active(), 0);
        assert!(h.finish().is_empty(), "a failed batch never moves the low watermark");
    }

    #[test]
    fn test_failed_commit_holds_back_low_watermark_until_settled() {
        let mut h = Harness::new();

        let mut failed = h.batch();
        failed.add_commit(ts(1), ts(3), h.channel.clone(), ctx(), Some(ts(2)));
        let event = PersistEvent::failed(ClosedBatch::new(BatchSeq::FIRST, failed), "disk full");
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.oldest_in_doubt(), Some(ts(1)));
        assert_eq!(h.processor.low_watermark(), None);

        // A later commit would finalize start 1; it is clamped instead.
        let mut next = h.batch();
        next.add_commit(ts(2), ts(5), h.channel.clone(), ctx(), Some(ts(4)));
        let event = h.durable(1, next);
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.low_watermark(), Some(ts(1)));
        assert_eq!(h.processor.oldest_in_doubt(), Some(ts(1)));

        // The retry replays the cached commit and makes it durable.
        let mut retry = h.batch();
        retry.add_commit_retry(
            ts(1),
            RetryState::Resolved(Some(Decision::Committed(ts(3)))),
            h.channel.clone(),
            ctx(),
        );
        retry.add_abort(ts(4), h.channel.clone(), ctx(), Some(ts(6)));
        let event = h.durable(2, retry);
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.oldest_in_doubt(), None);
        assert_eq!(h.processor.low_watermark(), Some(ts(6)));

        let replies = h.drain();
        assert!(matches!(replies[0], Response::Error { start: Some(s), .. } if s == ts(1)));
        assert_eq!(
            replies[1],
            Response::Committed {
                start: ts(2),
                commit: ts(5),
                low_watermark: Some(ts(1))
            }
        );
        assert_eq!(
            replies[2],
            Response::Committed {
                start: ts(1),
                commit: ts(3),
                low_watermark: None
            }
        );
        assert_eq!(h.finish(), vec![ts(1), ts(6)]);
    }

    #[test]
    fn test_failed_abort_is_not_in_doubt() {
        let mut h = Harness::new();

        let mut failed = h.batch();
        failed.add_abort(ts(1), h.channel.clone(), ctx(), Some(ts(2)));
        failed.add_timestamp(ts(2), h.channel.clone(), ctx());
        let event = PersistEvent::failed(ClosedBatch::new(BatchSeq::FIRST, failed), "disk full");
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.oldest_in_doubt(), None);

        let mut next = h.batch();
        next.add_commit(ts(2), ts(3), h.channel.clone(), ctx(), Some(ts(4)));
        let event = h.durable(1, next);
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.low_watermark(), Some(ts(4)));
        assert_eq!(h.finish(), vec![ts(4)]);
    }

    #[test]
    fn test_abort_ack_does_not_settle_in_doubt_commit() {
        let mut h = Harness::new();

        let mut failed = h.batch();
        failed.add_commit(ts(1), ts(2), h.channel.clone(), ctx(), None);
        let event = PersistEvent::failed(ClosedBatch::new(BatchSeq::FIRST, failed), "disk full");
        h.processor.on_event(event).unwrap();

        let mut ack = h.batch();
        ack.add_abort_ack(ts(1), h.channel.clone(), ctx());
        let event = h.durable(1, ack);
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.oldest_in_doubt(), Some(ts(1)));

        // An unknown decision read back for the start still settles it.
        let mut retry = h.batch();
        retry.add_commit_retry(ts(1), RetryState::Resolved(None), h.channel.clone(), ctx());
        let event = h.durable(2, retry);
        h.processor.on_event(event).unwrap();
        assert_eq!(h.processor.oldest_in_doubt(), None);
    }

    #[test]
    fn test_disconnected_client_does_not_block() {
        let mut h = Harness::new();
        let (gone, rx) = ClientChannel::pair(ConnectionId::from_raw(2));
        drop(rx);

        let mut batch = h.batch();
        batch.add_timestamp(ts(1), gone, ctx());
        batch.add_timestamp(ts(2), h.channel.clone(), ctx());
        let event = h.durable(0, batch);
        h.processor.on_event(event).unwrap();

        assert_eq!(h.drain(), vec![Response::Timestamp { start: ts(2) }]);
        assert_eq!(h.processor.metrics.snapshot().replies_dropped, 1);
        assert_eq!(h.pool.num_active(), 0);
    }

    #[test]
    fn test_reply_kinds() {
        let mut h = Harness::new();
        let mut batch = h.batch();
        batch.add_abort(ts(1), h.channel.clone(), ctx(), None);
        batch.add_abort_ack(ts(2), h.channel.clone(), ctx());
        batch.add_commit_retry(
            ts(3),
            RetryState::Resolved(Some(Decision::Committed(ts(4)))),
            h.channel.clone(),
            ctx(),
        );
        batch.add_commit_retry(ts(5), RetryState::Resolved(None), h.channel.clone(), ctx());

        let event = h.durable(0, batch);
        h.processor.on_event(event).unwrap();

        assert_eq!(
            h.drain(),
            vec![
                Response::Aborted { start: ts(1) },
                Response::AbortAcknowledged { start: ts(2) },
                Response::Committed {
                    start: ts(3),
                    commit: ts(4),
                    low_watermark: None
                },
                Response::Aborted { start: ts(5) },
            ]
        );
    }
}
