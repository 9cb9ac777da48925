//! Pooled worker execution over message-passing channels
//!
//! This crate multiplexes many logical request streams over a small set of
//! isolated workers. A [`Worker`] is one long-lived handle over a backing
//! execution unit spawned through a [`PlatformWorker`]; a [`WorkerPool`]
//! shares a fixed or elastic set of workers between callers with
//! semaphore-bounded backpressure.
//!
//! The worker side of the wire is served by [`runner::serve`], which reads
//! request frames, runs a [`WorkerHandler`] per request, and writes the
//! response frames defined in [`drover_ipc`].

pub mod error;
pub mod manager;
pub mod platform;
pub mod pool;
pub mod queue;
pub mod runner;
pub mod worker;

pub use error::ExecError;
pub use manager::WorkerManager;
pub use platform::{BackingWorker, ChildProcessPlatform, InProcessPlatform, PlatformWorker, WorkerId};
pub use pool::{OnCreateFn, PoolOptions, PoolSizing, PoolStream, WorkerPool};
pub use queue::{FifoQueue, WorkerQueue, DEFAULT_QUEUE_CAPACITY};
pub use runner::{run_stdio, serve, WorkerHandler};
pub use worker::{EncodeFn, ExecuteStream, Worker, WorkerOptions};

pub use drover_ipc::{
    IpcError, Request, RequestId, Response, WorkerError, WorkerErrorKind, WorkerFrame,
};
