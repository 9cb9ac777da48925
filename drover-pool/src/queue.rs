//! Request queueing between execute callers and a worker's send loop
//!
//! The default queue is a bounded FIFO: `offer` suspends once the buffer is
//! full, which is where per-worker backpressure comes from. Callers can
//! supply their own [`WorkerQueue`] to change the dispatch discipline
//! (priority ordering, sharding by request id, and so on).

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use drover_ipc::RequestId;

/// Default capacity of a worker's request buffer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Buffer between request producers and a worker's dispatch loop.
#[async_trait]
pub trait WorkerQueue<I>: Send + Sync {
    /// Enqueue a request. Suspends while the buffer is full. Returns `false`
    /// if the queue has shut down and the item was not accepted.
    async fn offer(&self, id: RequestId, item: I) -> bool;

    /// Dequeue the next request. Returns `None` once the queue has shut down
    /// and drained.
    async fn take(&self) -> Option<(RequestId, I)>;

    /// Stop accepting new items. Items already queued are still delivered.
    fn shutdown(&self);
}

/// Bounded first-in first-out queue, the default dispatch discipline.
pub struct FifoQueue<I> {
    tx: std::sync::Mutex<Option<mpsc::Sender<(RequestId, I)>>>,
    rx: Mutex<mpsc::Receiver<(RequestId, I)>>,
}

impl<I> FifoQueue<I> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }
}

impl<I> Default for FifoQueue<I> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl<I: Send> WorkerQueue<I> for FifoQueue<I> {
    async fn offer(&self, id: RequestId, item: I) -> bool {
        let tx = match self.tx.lock().expect("queue sender lock").clone() {
            Some(tx) => tx,
            None => return false,
        };
        tx.send((id, item)).await.is_ok()
    }

    async fn take(&self) -> Option<(RequestId, I)> {
        self.rx.lock().await.recv().await
    }

    fn shutdown(&self) {
        self.tx.lock().expect("queue sender lock").take();
    }
}
