//! # tsoracle - Transaction Status Oracle
//!
//! tsoracle is the central arbiter of a snapshot-isolated transactional
//! system. It provides:
//!
//! - **Start timestamps**: strictly increasing, never reused across restarts
//! - **Commit decisions**: write-write conflict detection over row hashes
//! - **Durability**: every decision is persisted before its client hears it
//! - **A low watermark**: a monotone bound below which nothing is still open
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Clients / Transport                        │
//! │           (timestamp, commit, commit-retry, abort)              │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ bounded queue
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Request Processor                           │
//! │             (single thread, owns all decision state)            │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │  Timestamp  │  │  Conflict   │  │  Open Transactions      │ │
//! │  │   Oracle    │  │    Map      │  │  + Decision Cache       │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ closed batches (seq 0, 1, 2, ...)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Persistence Processor (N workers)                  │
//! │          (complete in any order, one commit log each)           │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ completion events
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Reply Processor                            │
//! │     (reorders by seq, replies, advances the low watermark)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Reply order**: batches are answered strictly in sequence order, and
//!    entries within a batch in insertion order
//! 2. **Durable before visible**: no reply leaves before its batch is durable
//! 3. **Bounded in-flight work**: at most `num_concurrent_writers` batches
//!    exist at once, enforced by the [`BatchPool`](batch::BatchPool)
//! 4. **Monotone low watermark**: persisted values strictly increase
//! 5. **Fenced restarts**: transactions started by a previous incarnation
//!    can never commit
//!
//! ## Module Organization
//!
//! - [`error`]: Error types for every failure mode
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: Timestamps, cell ids, requests and responses
//! - [`config`]: Tunables and environment overrides
//! - [`timestamp`]: Block-reserving timestamp allocator
//! - [`conflict`]: Conflict map and open-transaction tracking
//! - [`batch`]: Batches and the fixed-size batch pool
//! - [`commit_log`]: Durable commit/abort records
//! - [`request`]: The sequencing stage
//! - [`persistence`]: The durability worker pool
//! - [`reply`]: The reorder-and-reply stage
//! - [`watermark`]: Low-watermark storage and the background writer
//! - [`panicker`]: Fatal-condition reporting
//! - [`metrics`]: Pipeline counters
//! - [`api`]: The [`Tso`] entry point and an in-process client

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for oracle operations.
pub mod error;

/// SQLite schema definitions and database initialization.
///
/// All durable state (commit table, timestamp bound, low watermark) lives in
/// one SQLite file.
pub mod schema;

/// Domain types.
///
/// Newtypes for timestamps, batch sequence numbers and cell ids, plus the
/// request and response vocabulary shared by every stage.
pub mod types;

/// Configuration for the whole pipeline.
pub mod config;

/// Timestamp allocation with durable block reservations.
pub mod timestamp;

/// Write-write conflict detection state.
pub mod conflict;

/// Batches, closed batches and the batch pool.
///
/// The pool is the pipeline's only backpressure mechanism: the sequencing
/// stage cannot open a batch until a previous one has been fully replied.
pub mod batch;

/// The durable commit log.
pub mod commit_log;

/// The sequencing stage.
///
/// Owns the timestamp oracle, the conflict map and the open-transaction set,
/// and packs decisions into numbered batches.
pub mod request;

/// The persistence stage.
///
/// A fixed pool of workers makes closed batches durable. Completion order is
/// arbitrary; the reply stage restores sequence order.
pub mod persistence;

/// The reply stage.
///
/// Buffers completions that arrive early, replies in sequence order and
/// advances the low watermark.
pub mod reply;

/// Low-watermark persistence.
pub mod watermark;

/// Fatal-condition reporting.
pub mod panicker;

/// Pipeline counters.
pub mod metrics;

/// The oracle entry point.
///
/// The main entry point is [`Tso`](api::Tso).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{Backends, CommitOutcome, MemoryBackends, Tso, TsoClient};
pub use config::{DurabilityFailurePolicy, TsoConfig};
pub use error::{Error, Result};
pub use metrics::MetricsSnapshot;
pub use panicker::{Panicker, ProcessAbortPanicker, RecordingPanicker, UnwindPanicker};
pub use schema::Database;

pub use commit_log::{CommitLog, CommitRecord, Decision, MemoryCommitLog, SqliteCommitLog};
pub use types::{
    BatchSeq, CellId, ClientChannel, ConnectionId, MonitoringContext, Request, Response, Timestamp,
};
