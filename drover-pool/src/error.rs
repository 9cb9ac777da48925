//! Error taxonomy for request execution
//!
//! Request-scoped failures (`App`, `Encode`) are local to one stream.
//! `Worker` and `Defect` indicate the owning worker failed or broke the
//! protocol; the pool replaces such workers.

use serde_json::Value as JsonValue;
use thiserror::Error;

pub use drover_ipc::{WorkerError, WorkerErrorKind};

/// Failure of a single request, as observed by its caller.
#[derive(Debug, Error)]
pub enum ExecError<E> {
    /// Channel-level failure of the worker serving this request.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Typed error returned by worker-side logic for this request only.
    #[error("application error")]
    App(E),

    /// Unrecoverable worker-side crash or protocol violation.
    #[error("worker defect: {0}")]
    Defect(JsonValue),

    /// Single-value execution completed without emitting a value.
    #[error("request completed without a value")]
    NoValue,

    /// Single-value execution emitted more than one value.
    #[error("request emitted more than one value")]
    MultipleValues,
}

impl<E> ExecError<E> {
    /// Whether this failure terminates the worker rather than just this
    /// request.
    pub fn is_worker_scoped(&self) -> bool {
        matches!(self, ExecError::Worker(_))
    }
}
