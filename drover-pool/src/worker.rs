//! A worker: one multiplexing handle over a backing execution unit
//!
//! A `Worker` owns the request-id space for its backing unit. `execute`
//! registers a response sink, queues the request, and hands back a stream;
//! a single demultiplex loop routes inbound frames to sinks by id. Dropping
//! a stream before its terminal frame sends a best-effort interrupt upstream
//! and releases local bookkeeping immediately.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use drover_ipc::{Request, RequestId, Response, WorkerError, WorkerFrame};

use crate::error::ExecError;
use crate::platform::{BackingWorker, WorkerId};
use crate::queue::{FifoQueue, WorkerQueue};

/// Pre-send transform applied to each outgoing message. Failures surface
/// synchronously to the `execute` caller; no frame is sent.
pub type EncodeFn<I> = Arc<dyn Fn(I) -> Result<I, WorkerError> + Send + Sync>;

/// Options for a single worker.
pub struct WorkerOptions<I> {
    /// Number of requests the worker serves concurrently before further
    /// callers suspend.
    pub permits: usize,
    pub encode: Option<EncodeFn<I>>,
    /// Dispatch discipline between callers and the send loop; bounded FIFO
    /// when unset.
    pub queue: Option<Arc<dyn WorkerQueue<I>>>,
}

impl<I> Default for WorkerOptions<I> {
    fn default() -> Self {
        Self {
            permits: 1,
            encode: None,
            queue: None,
        }
    }
}

impl<I> Clone for WorkerOptions<I> {
    fn clone(&self) -> Self {
        Self {
            permits: self.permits,
            encode: self.encode.clone(),
            queue: self.queue.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum WorkerFate {
    Running,
    /// Terminated; carries the failure for abnormal termination.
    Closed(Option<WorkerError>),
}

type Sink<E, O> = mpsc::UnboundedSender<Result<O, ExecError<E>>>;

struct SinkTable<E, O> {
    entries: HashMap<RequestId, Sink<E, O>>,
    /// Ids that were allocated but no longer have a consumer: interrupted
    /// requests awaiting their terminal frame, and fire-and-forget sends.
    /// Frames for these ids are discarded rather than treated as protocol
    /// violations.
    released: HashSet<RequestId>,
}

impl<E, O> Default for SinkTable<E, O> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            released: HashSet::new(),
        }
    }
}

impl<E, O> SinkTable<E, O> {
    fn fail_all(&mut self, error: &WorkerError) {
        for (_, sink) in self.entries.drain() {
            let _ = sink.send(Err(ExecError::Worker(error.clone())));
        }
        self.released.clear();
    }
}

/// Marks the worker closed and fails every pending sink. Atomic with
/// respect to `submit`, which checks fate under the same table lock.
fn close_worker<E, O>(
    sinks: &Mutex<SinkTable<E, O>>,
    fate: &watch::Sender<WorkerFate>,
    error: Option<WorkerError>,
) {
    let mut table = sinks.lock().expect("sink table lock");
    let cause = error
        .clone()
        .unwrap_or_else(|| WorkerError::unknown("worker shut down with requests in flight"));
    table.fail_all(&cause);
    fate.send_if_modified(|current| {
        if matches!(current, WorkerFate::Running) {
            *current = WorkerFate::Closed(error);
            true
        } else {
            false
        }
    });
}

struct WorkerInner<I, E, O> {
    id: WorkerId,
    next_request_id: Arc<AtomicU64>,
    permits: Arc<Semaphore>,
    permit_count: usize,
    queue: Arc<dyn WorkerQueue<I>>,
    encode: Option<EncodeFn<I>>,
    outbound: mpsc::UnboundedSender<Request<I>>,
    sinks: Arc<Mutex<SinkTable<E, O>>>,
    fate_tx: Arc<watch::Sender<WorkerFate>>,
    fate_rx: watch::Receiver<WorkerFate>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl<I, E, O> Drop for WorkerInner<I, E, O> {
    fn drop(&mut self) {
        debug!(worker_id = self.id, "closing worker scope");
        self.queue.shutdown();
        close_worker(&self.sinks, &self.fate_tx, None);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A logical, long-lived handle to one backing execution unit. Cheap to
/// clone; the backing unit is torn down when the last clone drops.
pub struct Worker<I, E, O> {
    inner: Arc<WorkerInner<I, E, O>>,
}

impl<I, E, O> Clone for Worker<I, E, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, E, O> Worker<I, E, O> {
    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    /// Whether the worker still accepts requests.
    pub fn is_open(&self) -> bool {
        matches!(&*self.inner.fate_rx.borrow(), WorkerFate::Running)
    }

    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub(crate) fn permit_count(&self) -> usize {
        self.inner.permit_count
    }

    pub(crate) fn try_acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.permits.clone().try_acquire_owned().ok()
    }

    pub(crate) fn subscribe_fate(&self) -> watch::Receiver<WorkerFate> {
        self.inner.fate_rx.clone()
    }

    fn closed_error(&self) -> WorkerError {
        match &*self.inner.fate_rx.borrow() {
            WorkerFate::Closed(Some(error)) => error.clone(),
            _ => WorkerError::unknown("worker terminated"),
        }
    }
}

impl<I, E, O> Worker<I, E, O>
where
    I: Send + 'static,
    E: Send + 'static,
    O: Send + 'static,
{
    /// Wire a spawned backing unit into a live worker: one demultiplex
    /// loop, one send loop gated on the readiness handshake.
    pub(crate) fn start(
        id: WorkerId,
        backing: BackingWorker<I, E, O>,
        options: WorkerOptions<I>,
    ) -> Self {
        let BackingWorker { outbound, inbound } = backing;
        let queue: Arc<dyn WorkerQueue<I>> = options
            .queue
            .unwrap_or_else(|| Arc::new(FifoQueue::default()));
        let permit_count = options.permits.max(1);
        let next_request_id = Arc::new(AtomicU64::new(1));
        let sinks: Arc<Mutex<SinkTable<E, O>>> = Arc::new(Mutex::new(SinkTable::default()));
        let (fate_tx, fate_rx) = watch::channel(WorkerFate::Running);
        let fate_tx = Arc::new(fate_tx);
        let (ready_tx, ready_rx) = oneshot::channel();

        let demux = tokio::spawn(demux_loop(
            id,
            inbound,
            sinks.clone(),
            fate_tx.clone(),
            next_request_id.clone(),
            ready_tx,
        ));
        let send = tokio::spawn(send_loop(
            queue.clone(),
            outbound.clone(),
            sinks.clone(),
            ready_rx,
        ));

        Self {
            inner: Arc::new(WorkerInner {
                id,
                next_request_id,
                permits: Arc::new(Semaphore::new(permit_count)),
                permit_count,
                queue,
                encode: options.encode,
                outbound,
                sinks,
                fate_tx,
                fate_rx,
                tasks: vec![demux, send],
            }),
        }
    }

    /// Resolves when the backing unit terminates; `Err` for abnormal
    /// termination.
    pub async fn join(&self) -> Result<(), WorkerError> {
        let mut fate = self.inner.fate_rx.clone();
        let closed = fate
            .wait_for(|state| matches!(state, WorkerFate::Closed(_)))
            .await;
        match closed.as_deref() {
            Ok(WorkerFate::Closed(Some(error))) => Err(error.clone()),
            _ => Ok(()),
        }
    }

    /// Execute a request, waiting for one of this worker's permits. The
    /// returned stream yields response items in frame order; dropping it
    /// early interrupts the request.
    pub async fn execute(&self, message: I) -> Result<ExecuteStream<I, E, O>, ExecError<E>> {
        if !self.is_open() {
            return Err(ExecError::Worker(self.closed_error()));
        }
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecError::Worker(self.closed_error()))?;
        self.submit(message, Some(permit)).await
    }

    /// Single-value convenience over [`execute`](Self::execute): fails if
    /// the stream emits zero or more than one item.
    pub async fn execute_once(&self, message: I) -> Result<O, ExecError<E>> {
        let stream = self.execute(message).await?;
        single_value(stream).await
    }

    /// Fire-and-forget send. Allocates a request id but registers no sink;
    /// any response frames for it are discarded.
    pub async fn notify(&self, message: I) -> Result<(), ExecError<E>> {
        let id = self.allocate_id()?;
        let message = self.encode_message(message)?;
        {
            let mut table = self.inner.sinks.lock().expect("sink table lock");
            if !self.is_open() {
                return Err(ExecError::Worker(self.closed_error()));
            }
            table.released.insert(id);
        }
        if !self.inner.queue.offer(id, message).await {
            let mut table = self.inner.sinks.lock().expect("sink table lock");
            table.released.remove(&id);
            return Err(ExecError::Worker(self.closed_error()));
        }
        Ok(())
    }

    /// Register a sink and queue the request. `permit` is `None` when the
    /// caller (the pool) already holds this worker's permit.
    pub(crate) async fn submit(
        &self,
        message: I,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<ExecuteStream<I, E, O>, ExecError<E>> {
        let id = self.allocate_id()?;
        let message = self.encode_message(message)?;
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        {
            let mut table = self.inner.sinks.lock().expect("sink table lock");
            if !self.is_open() {
                return Err(ExecError::Worker(self.closed_error()));
            }
            table.entries.insert(id, sink_tx);
        }
        if !self.inner.queue.offer(id, message).await {
            let mut table = self.inner.sinks.lock().expect("sink table lock");
            table.entries.remove(&id);
            return Err(ExecError::Worker(self.closed_error()));
        }
        Ok(ExecuteStream {
            id,
            receiver: sink_rx,
            sinks: self.inner.sinks.clone(),
            outbound: self.inner.outbound.clone(),
            _permit: permit,
        })
    }

    fn allocate_id(&self) -> Result<RequestId, ExecError<E>> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        if id == u64::MAX {
            // A stuck leak; poison the worker rather than reuse ids.
            let error = WorkerError::unknown("request id space exhausted");
            close_worker(&self.inner.sinks, &self.inner.fate_tx, Some(error.clone()));
            return Err(ExecError::Worker(error));
        }
        Ok(id)
    }

    fn encode_message(&self, message: I) -> Result<I, ExecError<E>> {
        match &self.inner.encode {
            Some(encode) => encode(message).map_err(ExecError::Worker),
            None => Ok(message),
        }
    }
}

/// Response stream for one request. Dropping it before completion sends a
/// best-effort `Interrupt` frame upstream and releases the id locally.
pub struct ExecuteStream<I, E, O> {
    id: RequestId,
    receiver: mpsc::UnboundedReceiver<Result<O, ExecError<E>>>,
    sinks: Arc<Mutex<SinkTable<E, O>>>,
    outbound: mpsc::UnboundedSender<Request<I>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<I, E, O> ExecuteStream<I, E, O> {
    pub fn request_id(&self) -> RequestId {
        self.id
    }
}

impl<I, E, O> std::fmt::Debug for ExecuteStream<I, E, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteStream").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<I, E, O> Stream for ExecuteStream<I, E, O> {
    type Item = Result<O, ExecError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl<I, E, O> Drop for ExecuteStream<I, E, O> {
    fn drop(&mut self) {
        let interrupted = {
            let mut table = self.sinks.lock().expect("sink table lock");
            if table.entries.remove(&self.id).is_some() {
                table.released.insert(self.id);
                true
            } else {
                false
            }
        };
        if interrupted {
            // Best effort; local bookkeeping is already released.
            let _ = self.outbound.send(Request::Interrupt { id: self.id });
        }
    }
}

/// Collapse a response stream to its only item.
pub(crate) async fn single_value<E, O, S>(mut stream: S) -> Result<O, ExecError<E>>
where
    S: Stream<Item = Result<O, ExecError<E>>> + Unpin,
{
    let first = match stream.next().await {
        None => return Err(ExecError::NoValue),
        Some(item) => item?,
    };
    match stream.next().await {
        None => Ok(first),
        Some(Err(error)) => Err(error),
        Some(Ok(_)) => Err(ExecError::MultipleValues),
    }
}

async fn send_loop<I, E, O>(
    queue: Arc<dyn WorkerQueue<I>>,
    outbound: mpsc::UnboundedSender<Request<I>>,
    sinks: Arc<Mutex<SinkTable<E, O>>>,
    ready: oneshot::Receiver<Result<(), WorkerError>>,
) where
    I: Send + 'static,
{
    // No request leaves before the readiness handshake is observed.
    match ready.await {
        Ok(Ok(())) => {}
        _ => {
            queue.shutdown();
            return;
        }
    }
    while let Some((id, payload)) = queue.take().await {
        if outbound.send(Request::Data { id, payload }).is_err() {
            // Transport gone; the demux loop fails the rest.
            let sink = sinks
                .lock()
                .expect("sink table lock")
                .entries
                .remove(&id);
            if let Some(sink) = sink {
                let _ = sink.send(Err(ExecError::Worker(WorkerError::send(
                    "worker channel closed",
                ))));
            }
            queue.shutdown();
            return;
        }
    }
}

async fn demux_loop<E, O>(
    worker_id: WorkerId,
    mut inbound: mpsc::UnboundedReceiver<Result<WorkerFrame<E, O>, WorkerError>>,
    sinks: Arc<Mutex<SinkTable<E, O>>>,
    fate: Arc<watch::Sender<WorkerFate>>,
    next_request_id: Arc<AtomicU64>,
    ready: oneshot::Sender<Result<(), WorkerError>>,
) {
    // Handshake: the first frame must be `[0]`.
    match inbound.recv().await {
        Some(Ok(WorkerFrame::Ready)) => {
            let _ = ready.send(Ok(()));
            debug!(worker_id, "worker ready");
        }
        Some(Ok(_)) => {
            let error = WorkerError::unknown(
                "protocol violation: frame received before readiness handshake",
            );
            let _ = ready.send(Err(error.clone()));
            close_worker(&sinks, &fate, Some(error));
            return;
        }
        Some(Err(error)) => {
            let _ = ready.send(Err(error.clone()));
            close_worker(&sinks, &fate, Some(error));
            return;
        }
        None => {
            let error = WorkerError::unknown("worker terminated during handshake");
            let _ = ready.send(Err(error.clone()));
            close_worker(&sinks, &fate, Some(error));
            return;
        }
    }

    loop {
        match inbound.recv().await {
            Some(Ok(WorkerFrame::Response(response))) => {
                if let Err(error) = dispatch(&sinks, &next_request_id, response) {
                    warn!(worker_id, error = %error, "worker protocol violation");
                    close_worker(&sinks, &fate, Some(error));
                    return;
                }
            }
            Some(Ok(WorkerFrame::Ready)) => {
                let error = WorkerError::unknown("protocol violation: duplicate readiness frame");
                close_worker(&sinks, &fate, Some(error));
                return;
            }
            Some(Ok(WorkerFrame::Shutdown)) | None => {
                debug!(worker_id, "worker terminated");
                close_worker(&sinks, &fate, None);
                return;
            }
            Some(Err(error)) => {
                warn!(worker_id, error = %error, "worker failed");
                close_worker(&sinks, &fate, Some(error));
                return;
            }
        }
    }
}

/// Route one response frame to its sink. `Err` means a protocol violation
/// that terminates the worker.
fn dispatch<E, O>(
    sinks: &Mutex<SinkTable<E, O>>,
    next_request_id: &AtomicU64,
    response: Response<E, O>,
) -> Result<(), WorkerError> {
    let id = response.id();
    let mut table = sinks.lock().expect("sink table lock");

    if id >= next_request_id.load(Ordering::SeqCst) {
        return Err(WorkerError::unknown(format!(
            "protocol violation: frame for unallocated request id {id}"
        )));
    }
    if table.released.contains(&id) {
        // Late frame for an interrupted or fire-and-forget request.
        if response.is_terminal() {
            table.released.remove(&id);
        }
        return Ok(());
    }
    if !table.entries.contains_key(&id) {
        return Err(WorkerError::unknown(format!(
            "protocol violation: frame for unknown request id {id}"
        )));
    }

    match response {
        Response::Data { payload, .. } => {
            if let Some(sink) = table.entries.get(&id) {
                let _ = sink.send(Ok(payload));
            }
        }
        Response::End { .. } => {
            table.entries.remove(&id);
        }
        Response::EndWithValue { payload, .. } => {
            if let Some(sink) = table.entries.remove(&id) {
                let _ = sink.send(Ok(payload));
            }
        }
        Response::Error { error, .. } => {
            if let Some(sink) = table.entries.remove(&id) {
                let _ = sink.send(Err(ExecError::App(error)));
            }
        }
        Response::Defect { cause, .. } => {
            if let Some(sink) = table.entries.remove(&id) {
                let _ = sink.send(Err(ExecError::Defect(cause)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    type TestWorker = Worker<String, String, String>;
    type Remote = (
        mpsc::UnboundedReceiver<Request<String>>,
        mpsc::UnboundedSender<Result<WorkerFrame<String, String>, WorkerError>>,
    );

    /// Worker over hand-held channels so tests can play the remote side.
    fn fake_worker(options: WorkerOptions<String>) -> (TestWorker, Remote) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let backing = BackingWorker {
            outbound: request_tx,
            inbound: frame_rx,
        };
        let worker = Worker::start(7, backing, options);
        (worker, (request_rx, frame_tx))
    }

    fn ready_worker(options: WorkerOptions<String>) -> (TestWorker, Remote) {
        let (worker, (requests, frames)) = fake_worker(options);
        frames.send(Ok(WorkerFrame::Ready)).unwrap();
        (worker, (requests, frames))
    }

    fn respond(
        frames: &mpsc::UnboundedSender<Result<WorkerFrame<String, String>, WorkerError>>,
        response: Response<String, String>,
    ) {
        frames.send(Ok(WorkerFrame::Response(response))).unwrap();
    }

    #[tokio::test]
    async fn round_trip_echo() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        let mut stream = worker.execute("ping".to_string()).await.unwrap();
        let sent = requests.recv().await.unwrap();
        assert_eq!(
            sent,
            Request::Data {
                id: 1,
                payload: "ping".to_string()
            }
        );

        respond(
            &frames,
            Response::Data {
                id: 1,
                payload: "pong".to_string(),
            },
        );
        respond(&frames, Response::End { id: 1 });

        assert_eq!(stream.next().await.unwrap().unwrap(), "pong");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn no_request_is_sent_before_readiness() {
        let (worker, (mut requests, frames)) = fake_worker(WorkerOptions::default());

        let _stream = worker.execute("early".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(requests.try_recv().is_err());

        frames.send(Ok(WorkerFrame::Ready)).unwrap();
        let sent = timeout(Duration::from_secs(1), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.id(), 1);
    }

    #[tokio::test]
    async fn end_with_value_emits_then_completes() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        let mut stream = worker.execute("calc".to_string()).await.unwrap();
        requests.recv().await.unwrap();
        respond(
            &frames,
            Response::EndWithValue {
                id: 1,
                payload: "42".to_string(),
            },
        );

        assert_eq!(stream.next().await.unwrap().unwrap(), "42");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn error_frame_fails_only_its_stream() {
        let (worker, (mut requests, frames)) =
            ready_worker(WorkerOptions {
                permits: 2,
                ..Default::default()
            });

        let mut first = worker.execute("a".to_string()).await.unwrap();
        let mut second = worker.execute("b".to_string()).await.unwrap();
        requests.recv().await.unwrap();
        requests.recv().await.unwrap();

        respond(
            &frames,
            Response::Error {
                id: 1,
                error: "rejected".to_string(),
            },
        );
        match first.next().await.unwrap().unwrap_err() {
            ExecError::App(error) => assert_eq!(error, "rejected"),
            other => panic!("expected application error, got {other:?}"),
        }

        respond(
            &frames,
            Response::EndWithValue {
                id: 2,
                payload: "ok".to_string(),
            },
        );
        assert_eq!(second.next().await.unwrap().unwrap(), "ok");
        assert!(worker.is_open());
    }

    #[tokio::test]
    async fn defect_frame_fails_only_its_stream() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        let mut stream = worker.execute("a".to_string()).await.unwrap();
        requests.recv().await.unwrap();
        respond(
            &frames,
            Response::Defect {
                id: 1,
                cause: serde_json::json!("stack overflow"),
            },
        );

        match stream.next().await.unwrap().unwrap_err() {
            ExecError::Defect(cause) => assert_eq!(cause, serde_json::json!("stack overflow")),
            other => panic!("expected defect, got {other:?}"),
        }
        assert!(worker.is_open());
    }

    #[tokio::test]
    async fn dropping_a_stream_interrupts_and_releases_the_id() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        let mut stream = worker.execute("long".to_string()).await.unwrap();
        requests.recv().await.unwrap();
        respond(
            &frames,
            Response::Data {
                id: 1,
                payload: "partial".to_string(),
            },
        );
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        drop(stream);

        let interrupt = requests.recv().await.unwrap();
        assert_eq!(interrupt, Request::Interrupt { id: 1 });

        // Late frames for the interrupted id are discarded, not defects.
        respond(
            &frames,
            Response::Data {
                id: 1,
                payload: "late".to_string(),
            },
        );
        respond(&frames, Response::End { id: 1 });

        let mut next = worker.execute("again".to_string()).await.unwrap();
        assert_eq!(requests.recv().await.unwrap().id(), 2);
        respond(&frames, Response::End { id: 2 });
        assert!(next.next().await.is_none());
        assert!(worker.is_open());
    }

    #[tokio::test]
    async fn join_failure_fails_all_in_flight_and_rejects_new_calls() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions {
            permits: 2,
            ..Default::default()
        });

        let mut first = worker.execute("a".to_string()).await.unwrap();
        let mut second = worker.execute("b".to_string()).await.unwrap();
        requests.recv().await.unwrap();
        requests.recv().await.unwrap();

        frames
            .send(Err(WorkerError::unknown("channel torn down")))
            .unwrap();

        for stream in [&mut first, &mut second] {
            match stream.next().await.unwrap().unwrap_err() {
                ExecError::Worker(error) => assert_eq!(error.message, "channel torn down"),
                other => panic!("expected worker error, got {other:?}"),
            }
        }

        let joined = worker.join().await;
        assert_eq!(joined.unwrap_err().message, "channel torn down");
        assert!(worker.execute("c".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn graceful_shutdown_resolves_join_and_fails_pending() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        let mut pending = worker.execute("a".to_string()).await.unwrap();
        requests.recv().await.unwrap();
        frames.send(Ok(WorkerFrame::Shutdown)).unwrap();

        assert!(matches!(
            pending.next().await.unwrap().unwrap_err(),
            ExecError::Worker(_)
        ));
        assert!(worker.join().await.is_ok());
        assert!(!worker.is_open());
    }

    #[tokio::test]
    async fn frame_for_unallocated_id_is_a_worker_defect() {
        let (worker, (_requests, frames)) = ready_worker(WorkerOptions::default());

        respond(&frames, Response::End { id: 99 });

        let error = worker.join().await.unwrap_err();
        assert!(error.message.contains("unallocated request id"));
    }

    #[tokio::test]
    async fn duplicate_terminal_frame_is_a_worker_defect() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        let mut stream = worker.execute("a".to_string()).await.unwrap();
        requests.recv().await.unwrap();
        respond(&frames, Response::End { id: 1 });
        assert!(stream.next().await.is_none());

        respond(&frames, Response::End { id: 1 });
        let error = worker.join().await.unwrap_err();
        assert!(error.message.contains("unknown request id"));
    }

    #[tokio::test(start_paused = true)]
    async fn permits_bound_concurrent_requests() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        let _first = worker.execute("a".to_string()).await.unwrap();
        requests.recv().await.unwrap();

        let second = worker.execute("b".to_string());
        assert!(timeout(Duration::from_millis(20), second).await.is_err());

        respond(&frames, Response::End { id: 1 });
        // First stream still holds its permit until dropped.
        drop(_first);
        let mut third = worker.execute("c".to_string()).await.unwrap();
        assert_eq!(requests.recv().await.unwrap().id(), 2);
        respond(&frames, Response::End { id: 2 });
        assert!(third.next().await.is_none());
    }

    #[tokio::test]
    async fn execute_once_rejects_multiple_values() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.execute_once("a".to_string()).await }
        });
        requests.recv().await.unwrap();
        respond(
            &frames,
            Response::Data {
                id: 1,
                payload: "one".to_string(),
            },
        );
        respond(
            &frames,
            Response::Data {
                id: 1,
                payload: "two".to_string(),
            },
        );
        respond(&frames, Response::End { id: 1 });

        match handle.await.unwrap().unwrap_err() {
            ExecError::MultipleValues => {}
            other => panic!("expected MultipleValues, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notify_expects_no_response() {
        let (worker, (mut requests, frames)) = ready_worker(WorkerOptions::default());

        worker.notify("flush".to_string()).await.unwrap();
        let sent = requests.recv().await.unwrap();
        assert_eq!(
            sent,
            Request::Data {
                id: 1,
                payload: "flush".to_string()
            }
        );

        // A stray reply to a fire-and-forget id is discarded.
        respond(&frames, Response::End { id: 1 });
        let mut check = worker.execute("next".to_string()).await.unwrap();
        assert_eq!(requests.recv().await.unwrap().id(), 2);
        respond(&frames, Response::End { id: 2 });
        assert!(check.next().await.is_none());
        assert!(worker.is_open());
    }

    #[tokio::test]
    async fn failed_notify_reclaims_its_request_id() {
        struct RejectingQueue;

        #[async_trait::async_trait]
        impl WorkerQueue<String> for RejectingQueue {
            async fn offer(&self, _id: RequestId, _item: String) -> bool {
                false
            }

            async fn take(&self) -> Option<(RequestId, String)> {
                std::future::pending().await
            }

            fn shutdown(&self) {}
        }

        let options = WorkerOptions {
            queue: Some(Arc::new(RejectingQueue)),
            ..Default::default()
        };
        let (worker, (_requests, frames)) = ready_worker(options);

        assert!(worker.notify("dropped".to_string()).await.is_err());

        // The id was reclaimed, so a frame for it is a correlation fault
        // rather than a silently discarded late frame.
        respond(&frames, Response::End { id: 1 });
        let error = worker.join().await.unwrap_err();
        assert!(error.message.contains("unknown request id"));
    }

    #[tokio::test]
    async fn encode_failure_surfaces_synchronously() {
        let options = WorkerOptions {
            encode: Some(Arc::new(|_message: String| {
                Err(WorkerError::encode("unserializable payload"))
            })),
            ..Default::default()
        };
        let (worker, (mut requests, _frames)) = ready_worker(options);

        match worker.execute("bad".to_string()).await.unwrap_err() {
            ExecError::Worker(error) => {
                assert_eq!(error.kind, drover_ipc::WorkerErrorKind::Encode)
            }
            other => panic!("expected encode error, got {other:?}"),
        }
        assert!(requests.try_recv().is_err());
    }
}
