//! Platform spawn strategies and the backing worker contract
//!
//! A [`BackingWorker`] is one native execution unit reduced to a channel
//! pair: an outbound sender of request frames and an inbound receiver of
//! worker frames (or a transport fault). A [`PlatformWorker`] encapsulates
//! how those units come to exist: tokio tasks in this process, child
//! processes over stdio, or anything else that can speak the frame protocol.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use drover_ipc::{FrameReader, FrameWriter, Request, WorkerError, WorkerFrame};

use crate::runner::{RequestTable, WorkerHandler};

/// Identifier of a worker, unique within its manager.
pub type WorkerId = usize;

/// One native execution unit, owned exclusively by one [`crate::Worker`].
///
/// Dropping the outbound sender is the termination signal: the platform
/// tears the native unit down and closes the inbound channel. The inbound
/// channel closing without a fault is a graceful end of stream.
pub struct BackingWorker<I, E, O> {
    pub(crate) outbound: mpsc::UnboundedSender<Request<I>>,
    pub(crate) inbound: mpsc::UnboundedReceiver<Result<WorkerFrame<E, O>, WorkerError>>,
}

impl<I, E, O> BackingWorker<I, E, O> {
    pub fn new(
        outbound: mpsc::UnboundedSender<Request<I>>,
        inbound: mpsc::UnboundedReceiver<Result<WorkerFrame<E, O>, WorkerError>>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Platform-specific spawn strategy. Worker ids are assigned by the
/// manager, never by callers.
#[async_trait]
pub trait PlatformWorker<I, E, O>: Send + Sync {
    async fn spawn(&self, id: WorkerId) -> Result<BackingWorker<I, E, O>, WorkerError>;
}

/// Runs workers as tokio tasks inside the current process. Messages move
/// by value; nothing is serialized.
pub struct InProcessPlatform<H> {
    handler: Arc<H>,
}

impl<H> InProcessPlatform<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl<I, E, O, H> PlatformWorker<I, E, O> for InProcessPlatform<H>
where
    I: Send + 'static,
    E: Send + 'static,
    O: Send + 'static,
    H: WorkerHandler<I, E, O> + 'static,
{
    async fn spawn(&self, id: WorkerId) -> Result<BackingWorker<I, E, O>, WorkerError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_in_process(id, self.handler.clone(), request_rx, frame_tx));
        Ok(BackingWorker {
            outbound: request_tx,
            inbound: frame_rx,
        })
    }
}

async fn run_in_process<I, E, O, H>(
    worker_id: WorkerId,
    handler: Arc<H>,
    mut requests: mpsc::UnboundedReceiver<Request<I>>,
    frames: mpsc::UnboundedSender<Result<WorkerFrame<E, O>, WorkerError>>,
) where
    I: Send + 'static,
    E: Send + 'static,
    O: Send + 'static,
    H: WorkerHandler<I, E, O> + 'static,
{
    // The request table writes plain frames; forward them with the fault
    // wrapper the backing contract expects.
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<WorkerFrame<E, O>>();
    let forward_to = frames.clone();
    tokio::spawn(async move {
        while let Some(frame) = sink_rx.recv().await {
            if forward_to.send(Ok(frame)).is_err() {
                return;
            }
        }
    });

    let table = RequestTable::new();
    let _ = frames.send(Ok(WorkerFrame::Ready));
    debug!(worker_id, "in-process worker ready");

    while let Some(request) = requests.recv().await {
        match request {
            Request::Data { id, payload } => {
                table.dispatch(id, payload, handler.clone(), sink_tx.clone())
            }
            Request::Interrupt { id } => table.interrupt(id),
        }
    }

    // Owning scope closed; cancel whatever is still running.
    table.abort_all();
    let _ = frames.send(Ok(WorkerFrame::Shutdown));
    debug!(worker_id, "in-process worker stopped");
}

/// Spawns each worker as a child process and speaks the frame protocol
/// over its stdio, the way a worker binary built on
/// [`crate::runner::run_stdio`] expects.
pub struct ChildProcessPlatform {
    command: Arc<dyn Fn(WorkerId) -> Command + Send + Sync>,
}

impl ChildProcessPlatform {
    /// `command` builds the process invocation for a given worker id.
    pub fn new(command: impl Fn(WorkerId) -> Command + Send + Sync + 'static) -> Self {
        Self {
            command: Arc::new(command),
        }
    }
}

#[async_trait]
impl<I, E, O> PlatformWorker<I, E, O> for ChildProcessPlatform
where
    I: Serialize + Send + Sync + 'static,
    E: DeserializeOwned + Send + 'static,
    O: DeserializeOwned + Send + 'static,
{
    async fn spawn(&self, id: WorkerId) -> Result<BackingWorker<I, E, O>, WorkerError> {
        let mut command = (self.command)(id);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| WorkerError::spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::spawn("child stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::spawn("child stdout was not captured"))?;
        debug!(worker_id = id, pid = child.id(), "spawned worker process");

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Request<I>>();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(request) = request_rx.recv().await {
                if let Err(error) = writer.write(&request).await {
                    warn!(worker_id = id, error = %error, "failed to write to worker process");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // The reader owns the child handle; when it finishes the process
        // is reaped, or killed if it is still running.
        tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            loop {
                match reader.read::<WorkerFrame<E, O>>().await {
                    Ok(Some(frame)) => {
                        if frame_tx.send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        let _ = frame_tx.send(Err(WorkerError::from(error)));
                        break;
                    }
                }
            }
            let _ = child.kill().await;
            debug!(worker_id = id, "worker process terminated");
        });

        Ok(BackingWorker {
            outbound: request_tx,
            inbound: frame_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use futures::StreamExt;
    use drover_ipc::Response;

    fn echo_platform() -> InProcessPlatform<impl WorkerHandler<String, String, String>> {
        InProcessPlatform::new(|request: String| {
            stream::iter(vec![Ok::<String, String>(format!("echo:{request}"))]).boxed()
        })
    }

    #[tokio::test]
    async fn readiness_frame_arrives_first() {
        let platform = echo_platform();
        let mut backing: BackingWorker<String, String, String> =
            platform.spawn(0).await.unwrap();

        let first = backing.inbound.recv().await.unwrap().unwrap();
        assert_eq!(first, WorkerFrame::Ready);
    }

    #[tokio::test]
    async fn requests_stream_data_then_end() {
        let platform = echo_platform();
        let mut backing: BackingWorker<String, String, String> =
            platform.spawn(0).await.unwrap();
        assert_eq!(
            backing.inbound.recv().await.unwrap().unwrap(),
            WorkerFrame::Ready
        );

        backing
            .outbound
            .send(Request::Data {
                id: 1,
                payload: "hi".to_string(),
            })
            .unwrap();

        assert_eq!(
            backing.inbound.recv().await.unwrap().unwrap(),
            WorkerFrame::Response(Response::Data {
                id: 1,
                payload: "echo:hi".to_string()
            })
        );
        assert_eq!(
            backing.inbound.recv().await.unwrap().unwrap(),
            WorkerFrame::Response(Response::End { id: 1 })
        );
    }

    #[tokio::test]
    async fn handler_panics_become_defect_frames() {
        let platform = InProcessPlatform::new(|_request: String| {
            stream::once(async { panic!("handler exploded") })
                .map(|_: ()| Ok::<String, String>(String::new()))
                .boxed()
        });
        let mut backing: BackingWorker<String, String, String> =
            platform.spawn(0).await.unwrap();
        assert_eq!(
            backing.inbound.recv().await.unwrap().unwrap(),
            WorkerFrame::Ready
        );

        backing
            .outbound
            .send(Request::Data {
                id: 1,
                payload: "boom".to_string(),
            })
            .unwrap();

        match backing.inbound.recv().await.unwrap().unwrap() {
            WorkerFrame::Response(Response::Defect { id, cause }) => {
                assert_eq!(id, 1);
                assert_eq!(cause, serde_json::json!("handler exploded"));
            }
            other => panic!("expected defect frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_the_sender_stops_the_worker() {
        let platform = echo_platform();
        let mut backing: BackingWorker<String, String, String> =
            platform.spawn(0).await.unwrap();
        assert_eq!(
            backing.inbound.recv().await.unwrap().unwrap(),
            WorkerFrame::Ready
        );

        drop(backing.outbound);
        assert_eq!(
            backing.inbound.recv().await.unwrap().unwrap(),
            WorkerFrame::Shutdown
        );
        assert!(backing.inbound.recv().await.is_none());
    }
}
