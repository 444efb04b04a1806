//! Longeron Core Error Types
//!
//! Error handling for the concurrency primitives. Contract violations
//! (resuming an unset coroutine, work-counter underflow) are not modeled
//! here; they panic with a diagnostic.

use thiserror::Error;

/// Errors surfaced by deadline timer waits.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// The wait was abandoned before the deadline: the timer was re-armed,
    /// canceled, or dropped.
    #[error("timer wait canceled")]
    Canceled,
}

impl TimerError {
    /// Check whether the wait ended without the deadline firing.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Failure transported out of a coroutine body.
///
/// A panic escaping the body is captured into the coroutine's failure slot
/// and returned from the *next* `resume`, exactly once. Resumes after that
/// succeed as no-ops.
#[derive(Error, Debug)]
pub enum ResumeError {
    /// The body panicked; the payload is rendered best-effort.
    #[error("coroutine body panicked: {0}")]
    Panicked(String),
}
