//! # Domain Types for the Oracle
//!
//! This module defines the core types that flow through the pipeline:
//! timestamps, batch sequence numbers, cell identities, client connections,
//! requests and responses.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Timestamps and batch sequence numbers are both `u64` underneath, but they
//! live in unrelated number spaces. Wrapping each in its own type means a
//! batch sequence can never be passed where a commit timestamp is expected.
//!
//! ## Invariants
//!
//! - [`Timestamp`]: strictly increasing, issued by exactly one authority
//! - [`BatchSeq`]: strictly increasing, unique across every batch ever closed
//! - [`CellId`]: deterministic hash of a row/cell key, stable across restarts

use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

// =============================================================================
// Timestamps
// =============================================================================

/// A globally monotonic 64-bit timestamp.
///
/// Doubles as a transaction's start identifier and, once committed, its
/// commit identifier. Only the request processor allocates new values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The smallest timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a Timestamp from a raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for storage and wire encoding.
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next timestamp, or `None` on overflow.
    pub fn checked_next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Adds an offset, saturating at `u64::MAX`.
    pub fn saturating_add(&self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Batch Sequence Numbers
// =============================================================================

/// The hand-off order of a closed batch.
///
/// Assigned exactly once, when the request processor closes a batch. The reply
/// processor delivers batches strictly in this order, starting at
/// [`BatchSeq::FIRST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BatchSeq(u64);

impl BatchSeq {
    /// The first sequence number handed out (0).
    pub const FIRST: BatchSeq = BatchSeq(0);

    /// Creates a BatchSeq from a raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    ///
    /// At one batch per microsecond this overflows after roughly 584,000 years.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BatchSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// Write Keys
// =============================================================================

/// The identity of a written row/cell, as seen by conflict detection.
///
/// Clients hash their (table, row, family, qualifier) keys down to 64 bits
/// before submitting a commit. Two different cells hashing to the same id can
/// only cause a spurious abort, never a missed conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(u64);

impl CellId {
    /// Hashes an arbitrary key into a cell id with XXH3-64.
    ///
    /// The algorithm is formally specified, so the same key maps to the same
    /// id on every platform and across restarts.
    pub fn from_key(key: impl AsRef<[u8]>) -> Self {
        Self(xxhash_rust::xxh3::xxh3_64(key.as_ref()))
    }

    /// Creates a CellId from an already-hashed value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw hash value.
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// =============================================================================
// Client Connections
// =============================================================================

/// Identifier of a client connection, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The reply side of a client connection.
///
/// The transport owns the receiving half and encodes whatever arrives onto the
/// wire. Sending never blocks: the channel is unbounded, and a closed
/// receiver (client gone) turns the send into a no-op.
///
/// # Rust Pattern: Cheap Clone
///
/// Cloning shares the same underlying channel, so every request submitted on a
/// connection replies into the same ordered stream.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Response>,
}

impl ClientChannel {
    /// Creates a connection and the receiver its replies are delivered to.
    pub fn pair(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    /// Returns the connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Delivers a reply. Returns false if the client has disconnected.
    pub fn send(&self, response: Response) -> bool {
        self.tx.send(response).is_ok()
    }

    /// Returns true while the receiving half is alive.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

// =============================================================================
// Monitoring Context
// =============================================================================

/// Opaque per-request context carried through the pipeline for monitoring.
///
/// Created when the transport decodes a request; consumed when the reply is
/// delivered. Named timers let each stage record how long it held the request.
#[derive(Debug, Clone)]
pub struct MonitoringContext {
    created: Instant,
    timers: Vec<(&'static str, Instant, Option<Duration>)>,
}

impl MonitoringContext {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            timers: Vec::new(),
        }
    }

    /// Starts (or restarts) the named timer.
    pub fn timer_start(&mut self, name: &'static str) {
        let now = Instant::now();
        match self.timers.iter_mut().find(|(n, _, _)| *n == name) {
            Some(timer) => *timer = (name, now, None),
            None => self.timers.push((name, now, None)),
        }
    }

    /// Stops the named timer and returns its duration.
    pub fn timer_stop(&mut self, name: &'static str) -> Option<Duration> {
        let timer = self.timers.iter_mut().find(|(n, _, _)| *n == name)?;
        let elapsed = timer.1.elapsed();
        timer.2 = Some(elapsed);
        Some(elapsed)
    }

    /// Returns the recorded duration of a stopped timer.
    pub fn timer(&self, name: &'static str) -> Option<Duration> {
        self.timers
            .iter()
            .find(|(n, _, _)| *n == name)
            .and_then(|(_, _, d)| *d)
    }

    /// Time since the request entered the pipeline.
    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }
}

impl Default for MonitoringContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Requests and Responses
// =============================================================================

/// A decoded client request, as delivered by the transport.
#[derive(Debug)]
pub enum Request {
    /// Begin a transaction: allocate a start timestamp.
    Timestamp {
        channel: ClientChannel,
        ctx: MonitoringContext,
    },

    /// Try to commit the transaction started at `start`.
    Commit {
        start: Timestamp,
        write_set: Vec<CellId>,
        channel: ClientChannel,
        ctx: MonitoringContext,
    },

    /// Ask again for the outcome of a commit already submitted.
    ///
    /// Sent by clients that lost their connection before the reply arrived.
    /// Never re-runs conflict detection.
    CommitRetry {
        start: Timestamp,
        channel: ClientChannel,
        ctx: MonitoringContext,
    },

    /// The client gave up on the transaction started at `start`.
    Abort {
        start: Timestamp,
        channel: ClientChannel,
        ctx: MonitoringContext,
    },
}

impl Request {
    pub fn timestamp(channel: ClientChannel) -> Self {
        Request::Timestamp {
            channel,
            ctx: MonitoringContext::new(),
        }
    }

    pub fn commit(start: Timestamp, write_set: Vec<CellId>, channel: ClientChannel) -> Self {
        Request::Commit {
            start,
            write_set,
            channel,
            ctx: MonitoringContext::new(),
        }
    }

    pub fn commit_retry(start: Timestamp, channel: ClientChannel) -> Self {
        Request::CommitRetry {
            start,
            channel,
            ctx: MonitoringContext::new(),
        }
    }

    pub fn abort(start: Timestamp, channel: ClientChannel) -> Self {
        Request::Abort {
            start,
            channel,
            ctx: MonitoringContext::new(),
        }
    }

    /// The connection this request came from.
    pub fn channel(&self) -> &ClientChannel {
        match self {
            Request::Timestamp { channel, .. }
            | Request::Commit { channel, .. }
            | Request::CommitRetry { channel, .. }
            | Request::Abort { channel, .. } => channel,
        }
    }
}

/// A reply delivered to a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The allocated start timestamp.
    Timestamp { start: Timestamp },

    /// The transaction committed.
    ///
    /// `low_watermark` is set when this commit's decision advanced the
    /// persisted low watermark.
    Committed {
        start: Timestamp,
        commit: Timestamp,
        low_watermark: Option<Timestamp>,
    },

    /// The transaction aborted (write-write conflict, or unknown on retry).
    Aborted { start: Timestamp },

    /// The client's abort notification was recorded.
    AbortAcknowledged { start: Timestamp },

    /// The request failed.
    ///
    /// `start` is set for entries of a batch that could not be made durable,
    /// and `None` when the request was refused before joining a batch.
    Error {
        start: Option<Timestamp>,
        reason: String,
    },
}

// =============================================================================
// Tests
// =============================================================================
