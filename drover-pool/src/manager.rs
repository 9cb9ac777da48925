//! Spawning workers over a platform
//!
//! `WorkerManager` pairs a [`PlatformWorker`] with worker-id allocation so
//! pools and direct callers spawn through one place.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use drover_ipc::WorkerError;

use crate::platform::{PlatformWorker, WorkerId};
use crate::worker::{Worker, WorkerOptions};

pub struct WorkerManager<I, E, O> {
    platform: Arc<dyn PlatformWorker<I, E, O>>,
    next_worker_id: AtomicUsize,
}

impl<I, E, O> WorkerManager<I, E, O>
where
    I: Send + 'static,
    E: Send + 'static,
    O: Send + 'static,
{
    pub fn new(platform: Arc<dyn PlatformWorker<I, E, O>>) -> Self {
        Self {
            platform,
            next_worker_id: AtomicUsize::new(0),
        }
    }

    /// Spawn one backing unit and wrap it in a live [`Worker`].
    pub async fn spawn(&self, options: WorkerOptions<I>) -> Result<Worker<I, E, O>, WorkerError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst) as WorkerId;
        debug!(worker_id = id, "spawning worker");
        let backing = self.platform.spawn(id).await?;
        Ok(Worker::start(id, backing, options))
    }
}
