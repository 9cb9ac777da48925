//! Worker-side request processing
//!
//! A worker runs a [`WorkerHandler`] over a stream of decoded [`Request`]
//! frames: it announces readiness, fans each `Data` frame out to a handler
//! task that emits `Data`/`End`/`Error` response frames, converts panics to
//! `Defect` frames, and aborts the matching task when an `Interrupt` frame
//! arrives. [`serve`] drives this loop over any byte stream;
//! [`run_stdio`] is the entry point for child-process worker binaries.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use drover_ipc::{FrameReader, FrameWriter, IpcError, Request, RequestId, Response, WorkerFrame};

/// Worker-side logic: turns one request into a stream of outputs.
pub trait WorkerHandler<I, E, O>: Send + Sync {
    fn process(&self, request: I) -> BoxStream<'static, Result<O, E>>;
}

impl<I, E, O, F> WorkerHandler<I, E, O> for F
where
    F: Fn(I) -> BoxStream<'static, Result<O, E>> + Send + Sync,
{
    fn process(&self, request: I) -> BoxStream<'static, Result<O, E>> {
        self(request)
    }
}

/// Tracks in-flight handler tasks by request id so interrupts can abort
/// them and panics can be reported as defects.
pub(crate) struct RequestTable {
    active: Arc<Mutex<HashMap<RequestId, AbortHandle>>>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the handler for one request, streaming response frames into
    /// `sink`. Frames for a single id are emitted in order; frames for
    /// different ids interleave freely.
    pub(crate) fn dispatch<I, E, O, H>(
        &self,
        id: RequestId,
        payload: I,
        handler: Arc<H>,
        sink: mpsc::UnboundedSender<WorkerFrame<E, O>>,
    ) where
        I: Send + 'static,
        E: Send + 'static,
        O: Send + 'static,
        H: WorkerHandler<I, E, O> + ?Sized + 'static,
    {
        let frames = sink.clone();
        let task = tokio::spawn(async move {
            let mut stream = handler.process(payload);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(payload) => {
                        if frames
                            .send(WorkerFrame::Response(Response::Data { id, payload }))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = frames.send(WorkerFrame::Response(Response::Error { id, error }));
                        return;
                    }
                }
            }
            let _ = frames.send(WorkerFrame::Response(Response::End { id }));
        });

        let abort = task.abort_handle();
        self.active
            .lock()
            .expect("request table lock")
            .insert(id, abort);

        let active = self.active.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(()) => {}
                Err(join) if join.is_panic() => {
                    let cause = panic_message(join.into_panic());
                    let _ = sink.send(WorkerFrame::Response(Response::Defect {
                        id,
                        cause: JsonValue::String(cause),
                    }));
                }
                // aborted by an interrupt; no frame owed
                Err(_) => {}
            }
            active.lock().expect("request table lock").remove(&id);
        });
    }

    pub(crate) fn interrupt(&self, id: RequestId) {
        if let Some(handle) = self
            .active
            .lock()
            .expect("request table lock")
            .remove(&id)
        {
            debug!(request_id = id, "interrupting in-flight request");
            handle.abort();
        }
    }

    pub(crate) fn abort_all(&self) {
        for (_, handle) in self.active.lock().expect("request table lock").drain() {
            handle.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker task panicked".to_string()
    }
}

/// Serve requests over a reader/writer pair until the inbound stream ends.
///
/// Sends the `[0]` readiness frame before accepting any request, and a `[]`
/// shutdown frame on the way out. Reader EOF is a graceful stop; a decode
/// failure is fatal and returned to the caller.
pub async fn serve<R, W, I, E, O, H>(reader: R, writer: W, handler: H) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    E: Serialize + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
    H: WorkerHandler<I, E, O> + 'static,
{
    let handler = Arc::new(handler);
    let mut reader = FrameReader::new(reader);
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<WorkerFrame<E, O>>();

    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(writer);
        while let Some(frame) = frame_rx.recv().await {
            if writer.write(&frame).await.is_err() {
                return;
            }
        }
        let _ = writer.write(&WorkerFrame::<E, O>::Shutdown).await;
        let _ = writer.close().await;
    });

    let table = RequestTable::new();
    // Listeners are installed; let the host know before it queues work.
    let _ = frame_tx.send(WorkerFrame::Ready);

    let result = loop {
        match reader.read::<Request<I>>().await {
            Ok(Some(Request::Data { id, payload })) => {
                table.dispatch(id, payload, handler.clone(), frame_tx.clone());
            }
            Ok(Some(Request::Interrupt { id })) => table.interrupt(id),
            Ok(None) => break Ok(()),
            Err(error) => break Err(error),
        }
    };

    table.abort_all();
    drop(frame_tx);
    let _ = writer_task.await;
    result
}

/// Serve requests over stdin/stdout. The entry point for a child-process
/// worker binary.
pub async fn run_stdio<I, E, O, H>(handler: H) -> Result<(), IpcError>
where
    I: DeserializeOwned + Send + 'static,
    E: Serialize + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
    H: WorkerHandler<I, E, O> + 'static,
{
    serve(tokio::io::stdin(), tokio::io::stdout(), handler).await
}
