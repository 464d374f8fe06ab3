//! # Fail-Fast Strategy
//!
//! Some conditions mean the pipeline's own invariants are broken: a batch
//! arrives at the reply stage after its turn, a batch carries an unresolved
//! retry, a client names a timestamp that was never issued. Continuing past
//! any of these risks giving a transaction the wrong serialization decision.
//!
//! Every such condition goes through a [`Panicker`]. Production wires
//! [`ProcessAbortPanicker`], which terminates the process. Tests wire
//! [`RecordingPanicker`] (keeps going, remembers what happened) or
//! [`UnwindPanicker`] (a plain Rust panic that `#[should_panic]` can catch).

use std::sync::{Arc, Mutex};

use tracing::error;

use crate::error::Error;

/// Handler for fatal invariant violations.
pub trait Panicker: Send + Sync {
    /// Reports a fatal condition. Implementations may not return.
    fn panic(&self, reason: &str);
}

/// Reports `reason` through `panicker` and returns the matching error.
///
/// The error is only observable when the panicker returns, that is, in tests.
pub(crate) fn raise(panicker: &dyn Panicker, reason: impl Into<String>) -> Error {
    let reason = reason.into();
    error!(%reason, "fatal invariant violation");
    panicker.panic(&reason);
    Error::Fatal(reason)
}

// =============================================================================
// Implementations
// =============================================================================

/// Logs and aborts the process. Never returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessAbortPanicker;

impl Panicker for ProcessAbortPanicker {
    fn panic(&self, reason: &str) {
        error!(%reason, "aborting process");
        std::process::abort();
    }
}

/// Raises a Rust panic on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnwindPanicker;

impl Panicker for UnwindPanicker {
    fn panic(&self, reason: &str) {
        panic!("fatal: {reason}");
    }
}

/// Records every fatal condition and returns normally.
///
/// Clones share the same record, so a test can keep one clone and hand the
/// other to the pipeline.
#[derive(Debug, Default, Clone)]
pub struct RecordingPanicker {
    reasons: Arc<Mutex<Vec<String>>>,
}

impl RecordingPanicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reason recorded so far, oldest first.
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.reasons.lock().unwrap().len()
    }

    pub fn has_panicked(&self) -> bool {
        self.count() > 0
    }
}

impl Panicker for RecordingPanicker {
    fn panic(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_panicker_shares_state() {
        let panicker = RecordingPanicker::new();
        let clone = panicker.clone();

        let err = raise(&clone, "batch #1 handled twice");
        assert!(matches!(err, Error::Fatal(ref r) if r == "batch #1 handled twice"));
        assert_eq!(panicker.reasons(), vec!["batch #1 handled twice".to_string()]);
        assert!(panicker.has_panicked());
    }

    #[test]
    #[should_panic(expected = "fatal: boom")]
    fn test_unwind_panicker_panics() {
        let _ = raise(&UnwindPanicker, "boom");
    }
}
