//! # Oracle Entry Point
//!
//! [`Tso`] wires the three stages together, recovers durable state on
//! startup and shuts everything down in order. [`TsoClient`] is a minimal
//! in-process client holding one connection.
//!
//! ## Thread Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                       Tokio runtime (callers)                      │
//! │   TsoClient ─┐                                      ┌─ replies     │
//! │   TsoClient ─┼─ tokio::sync::mpsc (bounded) ──┐     │  (unbounded  │
//! │   transport ─┘                                │     │   per conn)  │
//! └───────────────────────────────────────────────┼─────┼──────────────┘
//!                                                 ▼     │
//!   tso-request ──(ClosedBatch)──► tso-persist-0..N ──(PersistEvent)──► tso-reply
//!   (own current-thread runtime)   (one CommitLog each)                 │
//!                                                                       ▼
//!                                                               tso-lwm-writer
//! ```
//!
//! Every stage owns its state on its own thread. Only the [`BatchPool`] and
//! the metrics counters are shared, and batches move between stages by value.
//!
//! ## Startup Recovery
//!
//! 1. Load the last persisted low watermark
//! 2. Load the timestamp reservation bound and reserve a fresh block above it
//! 3. Fence the previous incarnation: the conflict map floor starts at the
//!    recovered bound
//!
//! ## Shutdown Order
//!
//! Sequencing stops first and submits its last batch; persistence drains its
//! queue; the reply stage delivers everything and stops the watermark writer.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info};

use crate::batch::BatchPool;
use crate::commit_log::{CommitLog, MemoryCommitLog, SqliteCommitLog};
use crate::config::TsoConfig;
use crate::error::{Error, Result};
use crate::metrics::{MetricsSnapshot, TsoMetrics};
use crate::panicker::{Panicker, ProcessAbortPanicker};
use crate::persistence::PersistenceProcessor;
use crate::reply::{spawn_reply_processor, ReplyProcessor};
use crate::request::{spawn_request_processor, RequestProcessor, RequestProcessorHandle};
use crate::timestamp::{MemoryTimestampStorage, SqliteTimestampStorage, TimestampOracle, TimestampStorage};
use crate::types::{CellId, ClientChannel, ConnectionId, Request, Response, Timestamp};
use crate::watermark::{
    LowWatermarkStore, LowWatermarkWriter, MemoryLowWatermarkStore, SqliteLowWatermarkStore,
};

// =============================================================================
// Backends
// =============================================================================

/// The durable collaborators the pipeline runs on.
pub struct Backends {
    /// One per persistence worker.
    pub commit_logs: Vec<Box<dyn CommitLog>>,
    pub low_watermark: Box<dyn LowWatermarkStore>,
    pub timestamps: Box<dyn TimestampStorage>,
}

impl Backends {
    /// Opens every backend on the SQLite file at `path`, with one connection
    /// per commit-log worker.
    pub fn sqlite(path: impl AsRef<Path>, num_writers: usize) -> Result<Self> {
        let path = path.as_ref();
        let commit_logs = (0..num_writers)
            .map(|_| SqliteCommitLog::open(path).map(|log| Box::new(log) as Box<dyn CommitLog>))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            commit_logs,
            low_watermark: Box::new(SqliteLowWatermarkStore::open(path)?),
            timestamps: Box::new(SqliteTimestampStorage::open(path)?),
        })
    }
}

/// In-memory backends whose state outlives any one [`Tso`].
///
/// Cloning shares the state, so a test can keep one copy for inspection and
/// hand [`backends`](Self::backends) to the oracle, or reopen an oracle on the
/// same state to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackends {
    pub commit_log: MemoryCommitLog,
    pub low_watermark: MemoryLowWatermarkStore,
    pub timestamps: MemoryTimestampStorage,
}

impl MemoryBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backends(&self, num_writers: usize) -> Backends {
        Backends {
            commit_logs: (0..num_writers)
                .map(|_| Box::new(self.commit_log.clone()) as Box<dyn CommitLog>)
                .collect(),
            low_watermark: Box::new(self.low_watermark.clone()),
            timestamps: Box::new(self.timestamps.clone()),
        }
    }
}

// =============================================================================
// Tso
// =============================================================================

/// A running oracle.
pub struct Tso {
    requests: RequestProcessorHandle,
    request_thread: JoinHandle<()>,
    persistence: PersistenceProcessor,
    reply_thread: JoinHandle<()>,
    pool: BatchPool,
    metrics: Arc<TsoMetrics>,
    next_connection: AtomicU64,
}

impl Tso {
    /// Opens an oracle on the SQLite file at `path`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tsoracle::{Tso, TsoConfig};
    ///
    /// # async fn demo() -> tsoracle::Result<()> {
    /// let tso = Tso::open("tso.db", TsoConfig::default())?;
    /// let mut client = tso.connect();
    /// let start = client.begin().await?;
    /// let outcome = client.commit(start, [tsoracle::CellId::from_key("row-1")]).await?;
    /// assert!(outcome.is_committed());
    /// tso.shutdown().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open(path: impl AsRef<Path>, config: TsoConfig) -> Result<Self> {
        let backends = Backends::sqlite(path, config.num_concurrent_writers)?;
        Self::with_backends(config, backends, Arc::new(ProcessAbortPanicker))
    }

    /// Opens an oracle on fresh in-memory backends.
    pub fn open_in_memory(config: TsoConfig) -> Result<Self> {
        let backends = MemoryBackends::new().backends(config.num_concurrent_writers);
        Self::with_backends(config, backends, Arc::new(ProcessAbortPanicker))
    }

    /// Recovers state from `backends` and starts every stage.
    pub fn with_backends(
        config: TsoConfig,
        backends: Backends,
        panicker: Arc<dyn Panicker>,
    ) -> Result<Self> {
        config.validate()?;
        if backends.commit_logs.len() != config.num_concurrent_writers {
            return Err(Error::Config(format!(
                "{} commit logs given for {} writers",
                backends.commit_logs.len(),
                config.num_concurrent_writers
            )));
        }

        let Backends {
            commit_logs,
            mut low_watermark,
            timestamps,
        } = backends;

        let recovered_lwm = low_watermark.load()?;
        let oracle = TimestampOracle::open(
            timestamps,
            Timestamp::from_raw(config.initial_timestamp),
            config.timestamp_reservation,
        )?;
        info!(
            low_watermark = ?recovered_lwm.map(|ts| ts.as_raw()),
            fence = oracle.recovered().as_raw(),
            writers = config.num_concurrent_writers,
            "starting oracle"
        );

        let metrics = Arc::new(TsoMetrics::new());
        let pool = BatchPool::new(config.num_concurrent_writers, config.batch_max_size);
        let (events_tx, events_rx) = std_mpsc::channel();

        let writer = LowWatermarkWriter::spawn(low_watermark, recovered_lwm)?;
        let reply = ReplyProcessor::new(
            writer,
            pool.clone(),
            Arc::clone(&panicker),
            Arc::clone(&metrics),
            recovered_lwm,
        );
        let reply_thread = spawn_reply_processor(reply, events_rx)?;

        let persistence = PersistenceProcessor::spawn(
            commit_logs,
            events_tx,
            config.durability_failure_policy,
            Arc::clone(&panicker),
            Arc::clone(&metrics),
        )?;

        let processor = RequestProcessor::new(
            oracle,
            &config,
            pool.clone(),
            persistence.handle(),
            panicker,
            Arc::clone(&metrics),
        )?;
        let (requests, request_thread) = spawn_request_processor(processor, &config)?;

        Ok(Self {
            requests,
            request_thread,
            persistence,
            reply_thread,
            pool,
            metrics,
            next_connection: AtomicU64::new(0),
        })
    }

    /// Opens a new client connection.
    pub fn connect(&self) -> TsoClient {
        let id = ConnectionId::from_raw(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (channel, replies) = ClientChannel::pair(id);
        TsoClient {
            channel,
            replies,
            requests: self.requests.clone(),
        }
    }

    /// Submits a decoded request, as a transport would. The reply is sent on
    /// the request's own channel.
    pub async fn submit(&self, request: Request) -> Result<()> {
        self.requests.submit(request).await
    }

    /// A handle for submitting requests from elsewhere.
    pub fn handle(&self) -> RequestProcessorHandle {
        self.requests.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Batches currently open, being persisted or awaiting reply.
    pub fn in_flight_batches(&self) -> usize {
        self.pool.num_active()
    }

    /// Flushes pending work, delivers every reply and stops all threads.
    pub async fn shutdown(self) -> Result<()> {
        self.requests.shutdown().await?;

        let Self {
            request_thread,
            persistence,
            reply_thread,
            ..
        } = self;

        tokio::task::spawn_blocking(move || {
            if request_thread.join().is_err() {
                error!("request processor thread panicked");
            }
            persistence.join();
            if reply_thread.join().is_err() {
                error!("reply processor thread panicked");
            }
        })
        .await
        .map_err(|e| Error::Fatal(format!("shutdown task failed: {e}")))?;

        info!("oracle stopped");
        Ok(())
    }
}

// =============================================================================
// Client
// =============================================================================

/// The outcome of a commit, as seen by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed {
        commit: Timestamp,
        /// Set when this commit raised the low watermark; the value has been
        /// requested from the writer, not necessarily made durable yet.
        low_watermark: Option<Timestamp>,
    },
    Aborted,
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}

/// One client connection.
///
/// Methods take `&mut self` and wait for their own reply, so replies on this
/// connection always match the request just sent.
#[derive(Debug)]
pub struct TsoClient {
    channel: ClientChannel,
    replies: UnboundedReceiver<Response>,
    requests: RequestProcessorHandle,
}

impl TsoClient {
    pub fn connection_id(&self) -> ConnectionId {
        self.channel.id()
    }

    /// Starts a transaction.
    pub async fn begin(&mut self) -> Result<Timestamp> {
        match self.call(Request::timestamp(self.channel.clone())).await? {
            Response::Timestamp { start } => Ok(start),
            other => Err(unexpected("timestamp", other)),
        }
    }

    /// Tries to commit the transaction started at `start`.
    pub async fn commit(
        &mut self,
        start: Timestamp,
        write_set: impl IntoIterator<Item = CellId>,
    ) -> Result<CommitOutcome> {
        let request = Request::commit(start, write_set.into_iter().collect(), self.channel.clone());
        let response = self.call(request).await?;
        commit_outcome(response)
    }

    /// Asks for the outcome of a commit submitted earlier.
    pub async fn retry_commit(&mut self, start: Timestamp) -> Result<CommitOutcome> {
        let response = self
            .call(Request::commit_retry(start, self.channel.clone()))
            .await?;
        commit_outcome(response)
    }

    /// Gives up on the transaction started at `start`.
    pub async fn abort(&mut self, start: Timestamp) -> Result<()> {
        match self.call(Request::abort(start, self.channel.clone())).await? {
            Response::AbortAcknowledged { .. } => Ok(()),
            other => Err(unexpected("abort acknowledgement", other)),
        }
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        self.requests.submit(request).await?;
        match self.replies.recv().await {
            // Entries of a failed batch carry their start; a request refused
            // before it reached a batch does not.
            Some(Response::Error {
                start: Some(_),
                reason,
            }) => Err(Error::PersistenceFailed(reason)),
            Some(Response::Error { start: None, reason }) => Err(Error::Rejected(reason)),
            Some(response) => Ok(response),
            None => Err(Error::ShutDown("oracle")),
        }
    }
}

fn commit_outcome(response: Response) -> Result<CommitOutcome> {
    match response {
        Response::Committed {
            commit,
            low_watermark,
            ..
        } => Ok(CommitOutcome::Committed {
            commit,
            low_watermark,
        }),
        Response::Aborted { .. } => Ok(CommitOutcome::Aborted),
        other => Err(unexpected("commit outcome", other)),
    }
}

fn unexpected(wanted: &str, got: Response) -> Error {
    Error::UnexpectedResponse(format!("expected {wanted}, got {got:?}"))
}

// =============================================================================
// Tests
// =============================================================================
