//! Error taxonomy for the queue.
//!
//! Mirrors the kinds enumerated in the design: [`QueueError::Validation`] is
//! the only variant a producer should act on directly; [`QueueError::Conflict`]
//! is expected and benign for every caller except `enqueue`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Bad enqueue input: unknown job type, out-of-range priority, etc.
    #[error("validation error: {0}")]
    Validation(String),

    /// Optimistic-lock loss or a state-precondition violation. Callers other
    /// than `enqueue` should treat this as a no-op, not a hard failure.
    #[error("store conflict")]
    Conflict,

    /// No `JobProcessor` registered for this job's `job_type`.
    #[error("no processor registered for job type {0:?}")]
    ProcessorNotFound(String),

    /// Referenced id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else: store unreachable, serialization failure, etc.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Whether a [`QueueError`] is safe to show to an API caller verbatim, or
/// must be collapsed to a generic message. Only validation and not-found
/// errors carry caller-actionable detail; everything else risks leaking
/// internals.
pub trait Categorizable {
    fn is_caller_visible(&self) -> bool;
}

impl Categorizable for QueueError {
    fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            QueueError::Validation(_) | QueueError::NotFound(_) | QueueError::Conflict
        )
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
