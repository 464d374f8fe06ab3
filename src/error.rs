//! # Error Handling for the Oracle
//!
//! A single error enum ([`Error`]) covers every failure mode of the pipeline.
//! Callers either match on it or propagate it with `?`.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Backend | SQLite error, schema mismatch | Log and investigate |
//! | Fatal | Stale batch sequence, malformed batch | Process terminates |
//! | Durability | Commit log append failed | Client sees an error reply |
//! | Lifecycle | Pipeline shut down | Reconnect or stop |
//!
//! ## What is NOT an Error
//!
//! A commit that loses a write-write conflict is a normal outcome. It is
//! reported as [`Response::Aborted`](crate::types::Response::Aborted), never
//! through this enum.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in oracle operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Backend Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate. The `#[from]` attribute lets
    /// `?` convert rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corrupt metadata.
    #[error("schema error: {0}")]
    Schema(String),

    /// Configuration rejected by [`TsoConfig::validate`](crate::config::TsoConfig::validate).
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Pipeline Errors
    // =========================================================================

    /// An invariant of the pipeline was violated.
    ///
    /// # When This Happens
    ///
    /// - A completion event arrives with a sequence number already handled
    /// - A batch reaches the reply stage with an unresolved commit retry
    /// - A client refers to a timestamp that was never issued
    ///
    /// The [`Panicker`](crate::panicker::Panicker) is always invoked before this
    /// value is returned. In production that terminates the process; in tests
    /// a recording panicker lets the error surface here instead.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A durability write could not be proven to have completed.
    ///
    /// Only surfaced to clients under
    /// [`DurabilityFailurePolicy::ReplyError`](crate::config::DurabilityFailurePolicy::ReplyError).
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// The sequencing stage refused a request before deciding it, for
    /// example a start timestamp that was never issued.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A pipeline component is no longer accepting work.
    #[error("{0} has shut down")]
    ShutDown(&'static str),

    /// A client received a reply of a kind it did not ask for.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let fatal = Error::Fatal("batch 3 arrived after batch 5 was handled".to_string());
        assert_eq!(
            fatal.to_string(),
            "fatal: batch 3 arrived after batch 5 was handled"
        );

        let shut = Error::ShutDown("request processor");
        assert_eq!(shut.to_string(), "request processor has shut down");

        let persist = Error::PersistenceFailed("disk full".to_string());
        assert_eq!(persist.to_string(), "persistence failed: disk full");
    }

    /// The `#[from]` attribute generates a `From` impl so `?` converts
    /// rusqlite errors into ours.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }
}
