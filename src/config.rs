//! # Oracle Configuration
//!
//! All tunables consumed by the pipeline live in [`TsoConfig`]. Defaults are
//! suitable for a single-node deployment; [`TsoConfig::from_env`] overlays a
//! handful of environment variables for operators.
//!
//! ## The Writer Count
//!
//! `num_concurrent_writers` sizes two things at once: the [`BatchPool`] and the
//! persistence worker pool. Keeping them equal is what bounds the number of
//! in-flight batches to the number of writers that can make them durable.
//!
//! [`BatchPool`]: crate::batch::BatchPool

use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default number of concurrent durability writers (and pooled batches).
pub const DEFAULT_NUM_CONCURRENT_WRITERS: usize = 4;

/// Default maximum entries per batch before a size-based hand-off.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 25;

/// Default time-based hand-off boundary in milliseconds.
///
/// Measured from the first entry recorded in the open batch.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;

/// Default number of timestamps reserved durably in one go.
pub const DEFAULT_TIMESTAMP_RESERVATION: u64 = 10_000_000;

/// Default hard bound on conflict-map entries.
pub const DEFAULT_CONFLICT_MAP_CAPACITY: usize = 1_000_000;

/// Default hard bound on tracked open transactions.
pub const DEFAULT_MAX_OPEN_TRANSACTIONS: usize = 1_000_000;

/// Default capacity of the decided-transaction cache used to replay retries.
pub const DEFAULT_DECISION_CACHE_SIZE: usize = 100_000;

/// Default bound of the request queue feeding the sequencing stage.
pub const DEFAULT_REQUEST_CHANNEL_SIZE: usize = 4096;

// =============================================================================
// Durability Failure Policy
// =============================================================================

/// What to do when the commit log fails to append a batch.
///
/// Either way, no client is ever told a decision is final when it was not
/// proven durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityFailurePolicy {
    /// Raise a fatal condition through the panicker. In production this
    /// terminates the process.
    #[default]
    Abort,

    /// Reply with [`Response::Error`](crate::types::Response::Error) to every
    /// request of the failed batch, still in batch-sequence order.
    ReplyError,
}

impl DurabilityFailurePolicy {
    /// Parses the value of `TSO_DURABILITY_FAILURE_POLICY`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "reply-error" | "reply_error" => Ok(Self::ReplyError),
            other => Err(Error::Config(format!(
                "unknown durability failure policy '{other}' (expected 'abort' or 'reply-error')"
            ))),
        }
    }
}

// =============================================================================
// TsoConfig
// =============================================================================

/// Configuration for the whole pipeline.
#[derive(Debug, Clone)]
pub struct TsoConfig {
    /// Sizes both the batch pool and the persistence worker pool.
    pub num_concurrent_writers: usize,

    /// A batch is handed off once it holds this many entries.
    pub batch_max_size: usize,

    /// A non-empty batch is handed off once it has been open this long.
    pub batch_timeout: Duration,

    /// First timestamp issued on a cold start (no persisted state).
    pub initial_timestamp: u64,

    /// Number of timestamps reserved per durable reservation.
    pub timestamp_reservation: u64,

    /// Hard bound on conflict-map entries.
    pub conflict_map_capacity: usize,

    /// Hard bound on undecided transactions tracked for the low watermark.
    pub max_open_transactions: usize,

    /// LRU capacity of decisions kept for commit-retry replay.
    pub decision_cache_size: usize,

    pub durability_failure_policy: DurabilityFailurePolicy,

    /// Bound of the request queue. Senders wait when it is full.
    pub request_channel_size: usize,
}

impl Default for TsoConfig {
    fn default() -> Self {
        Self {
            num_concurrent_writers: DEFAULT_NUM_CONCURRENT_WRITERS,
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            initial_timestamp: 0,
            timestamp_reservation: DEFAULT_TIMESTAMP_RESERVATION,
            conflict_map_capacity: DEFAULT_CONFLICT_MAP_CAPACITY,
            max_open_transactions: DEFAULT_MAX_OPEN_TRANSACTIONS,
            decision_cache_size: DEFAULT_DECISION_CACHE_SIZE,
            durability_failure_policy: DurabilityFailurePolicy::default(),
            request_channel_size: DEFAULT_REQUEST_CHANNEL_SIZE,
        }
    }
}

impl TsoConfig {
    /// Builds a configuration from defaults overlaid with environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `TSO_NUM_WRITERS` | `num_concurrent_writers` |
    /// | `TSO_BATCH_MAX_SIZE` | `batch_max_size` |
    /// | `TSO_BATCH_TIMEOUT_MS` | `batch_timeout` |
    /// | `TSO_INITIAL_TIMESTAMP` | `initial_timestamp` |
    /// | `TSO_DURABILITY_FAILURE_POLICY` | `durability_failure_policy` |
    ///
    /// The result is validated before it is returned.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("TSO_NUM_WRITERS") {
            config.num_concurrent_writers = parse_number("TSO_NUM_WRITERS", &v)?;
        }
        if let Some(v) = lookup("TSO_BATCH_MAX_SIZE") {
            config.batch_max_size = parse_number("TSO_BATCH_MAX_SIZE", &v)?;
        }
        if let Some(v) = lookup("TSO_BATCH_TIMEOUT_MS") {
            config.batch_timeout = Duration::from_millis(parse_number("TSO_BATCH_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("TSO_INITIAL_TIMESTAMP") {
            config.initial_timestamp = parse_number("TSO_INITIAL_TIMESTAMP", &v)?;
        }
        if let Some(v) = lookup("TSO_DURABILITY_FAILURE_POLICY") {
            config.durability_failure_policy = DurabilityFailurePolicy::parse(&v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_concurrent_writers == 0 {
            return Err(Error::Config("num_concurrent_writers must be at least 1".into()));
        }
        if self.batch_max_size == 0 {
            return Err(Error::Config("batch_max_size must be at least 1".into()));
        }
        if self.batch_timeout.is_zero() {
            return Err(Error::Config("batch_timeout must be non-zero".into()));
        }
        if self.timestamp_reservation == 0 {
            return Err(Error::Config("timestamp_reservation must be at least 1".into()));
        }
        if self.conflict_map_capacity == 0 {
            return Err(Error::Config("conflict_map_capacity must be at least 1".into()));
        }
        if self.max_open_transactions == 0 {
            return Err(Error::Config("max_open_transactions must be at least 1".into()));
        }
        // Every decision still in flight must be replayable from the cache.
        let in_flight = self.num_concurrent_writers.saturating_mul(self.batch_max_size);
        if self.decision_cache_size < in_flight {
            return Err(Error::Config(format!(
                "decision_cache_size ({}) must cover every in-flight entry ({in_flight})",
                self.decision_cache_size
            )));
        }
        if self.request_channel_size == 0 {
            return Err(Error::Config("request_channel_size must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: '{value}' is not a valid number")))
}

// =============================================================================
// Tests
// =============================================================================
