//! Wire protocol definitions and frame types
//!
//! Frames are positional JSON arrays. Host to worker:
//! `[id, 0, payload]` (data) or `[id, 1]` (interrupt). Worker to host:
//! `[0]` (ready handshake), `[]` (graceful shutdown), or `[id, tag, ...]`
//! where tag 0 is data, 1 is end (with an optional final value), 2 is a
//! typed application error and 3 is a defect.

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Per-worker request identifier. Allocated monotonically starting at 1;
/// id 0 is reserved for the readiness handshake frame.
pub type RequestId = u64;

const TAG_DATA: u8 = 0;
const TAG_END: u8 = 1;
const TAG_ERROR: u8 = 2;
const TAG_DEFECT: u8 = 3;

const TAG_INTERRUPT: u8 = 1;

/// Frames sent from the host to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Request<I> {
    /// Dispatch a new request.
    Data { id: RequestId, payload: I },
    /// Best-effort cancellation of an in-flight request.
    Interrupt { id: RequestId },
}

impl<I> Request<I> {
    pub fn id(&self) -> RequestId {
        match self {
            Request::Data { id, .. } | Request::Interrupt { id } => *id,
        }
    }
}

/// Frames sent from a worker back to the host, scoped to one request id.
///
/// For a given id, zero or more `Data` frames are followed by exactly one
/// terminal frame (`End`, `EndWithValue`, `Error` or `Defect`).
#[derive(Debug, Clone, PartialEq)]
pub enum Response<E, O> {
    Data { id: RequestId, payload: O },
    End { id: RequestId },
    EndWithValue { id: RequestId, payload: O },
    Error { id: RequestId, error: E },
    Defect { id: RequestId, cause: JsonValue },
}

impl<E, O> Response<E, O> {
    pub fn id(&self) -> RequestId {
        match self {
            Response::Data { id, .. }
            | Response::End { id }
            | Response::EndWithValue { id, .. }
            | Response::Error { id, .. }
            | Response::Defect { id, .. } => *id,
        }
    }

    /// Whether this frame closes its request id.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Data { .. })
    }
}

/// Transport-level framing of the worker-to-host direction: the readiness
/// handshake and graceful shutdown envelopes around [`Response`] frames.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerFrame<E, O> {
    /// `[0]`, sent once after the worker installed its listeners, before
    /// any request is accepted.
    Ready,
    /// `[]`, a graceful end of stream; equivalent to the channel closing.
    Shutdown,
    Response(Response<E, O>),
}

impl<I: Serialize> Serialize for Request<I> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Request::Data { id, payload } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(id)?;
                seq.serialize_element(&TAG_DATA)?;
                seq.serialize_element(payload)?;
                seq.end()
            }
            Request::Interrupt { id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(id)?;
                seq.serialize_element(&TAG_INTERRUPT)?;
                seq.end()
            }
        }
    }
}

impl<'de, I: Deserialize<'de>> Deserialize<'de> for Request<I> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RequestVisitor<I>(PhantomData<I>);

        impl<'de, I: Deserialize<'de>> Visitor<'de> for RequestVisitor<I> {
            type Value = Request<I>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a request frame `[id, tag, payload?]`")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let id: RequestId = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let tag: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                match tag {
                    TAG_DATA => {
                        let payload: I = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(Request::Data { id, payload })
                    }
                    TAG_INTERRUPT => Ok(Request::Interrupt { id }),
                    other => Err(de::Error::custom(format!("unknown request tag {other}"))),
                }
            }
        }

        deserializer.deserialize_seq(RequestVisitor(PhantomData))
    }
}

impl<E: Serialize, O: Serialize> Serialize for Response<E, O> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Response::Data { id, payload } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(id)?;
                seq.serialize_element(&TAG_DATA)?;
                seq.serialize_element(payload)?;
                seq.end()
            }
            Response::End { id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(id)?;
                seq.serialize_element(&TAG_END)?;
                seq.end()
            }
            Response::EndWithValue { id, payload } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(id)?;
                seq.serialize_element(&TAG_END)?;
                seq.serialize_element(payload)?;
                seq.end()
            }
            Response::Error { id, error } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(id)?;
                seq.serialize_element(&TAG_ERROR)?;
                seq.serialize_element(error)?;
                seq.end()
            }
            Response::Defect { id, cause } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(id)?;
                seq.serialize_element(&TAG_DEFECT)?;
                seq.serialize_element(cause)?;
                seq.end()
            }
        }
    }
}

/// Decodes the `[tag, ...]` tail of a response frame once the id has been
/// consumed. Shared between the `Response` and `WorkerFrame` visitors.
fn response_tail<'de, A, E, O>(id: RequestId, seq: &mut A) -> Result<Response<E, O>, A::Error>
where
    A: SeqAccess<'de>,
    E: Deserialize<'de>,
    O: Deserialize<'de>,
{
    let tag: u8 = seq
        .next_element()?
        .ok_or_else(|| de::Error::custom("response frame missing tag"))?;
    match tag {
        TAG_DATA => {
            let payload: O = seq
                .next_element()?
                .ok_or_else(|| de::Error::custom("data frame missing payload"))?;
            Ok(Response::Data { id, payload })
        }
        TAG_END => match seq.next_element::<O>()? {
            Some(payload) => Ok(Response::EndWithValue { id, payload }),
            None => Ok(Response::End { id }),
        },
        TAG_ERROR => {
            let error: E = seq
                .next_element()?
                .ok_or_else(|| de::Error::custom("error frame missing payload"))?;
            Ok(Response::Error { id, error })
        }
        TAG_DEFECT => {
            let cause: JsonValue = seq
                .next_element()?
                .ok_or_else(|| de::Error::custom("defect frame missing cause"))?;
            Ok(Response::Defect { id, cause })
        }
        other => Err(de::Error::custom(format!("unknown response tag {other}"))),
    }
}

impl<'de, E: Deserialize<'de>, O: Deserialize<'de>> Deserialize<'de> for Response<E, O> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ResponseVisitor<E, O>(PhantomData<(E, O)>);

        impl<'de, E: Deserialize<'de>, O: Deserialize<'de>> Visitor<'de> for ResponseVisitor<E, O> {
            type Value = Response<E, O>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a response frame `[id, tag, payload?]`")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let id: RequestId = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                response_tail(id, &mut seq)
            }
        }

        deserializer.deserialize_seq(ResponseVisitor(PhantomData))
    }
}

impl<E: Serialize, O: Serialize> Serialize for WorkerFrame<E, O> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WorkerFrame::Ready => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(&0u64)?;
                seq.end()
            }
            WorkerFrame::Shutdown => serializer.serialize_seq(Some(0))?.end(),
            WorkerFrame::Response(response) => response.serialize(serializer),
        }
    }
}

impl<'de, E: Deserialize<'de>, O: Deserialize<'de>> Deserialize<'de> for WorkerFrame<E, O> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameVisitor<E, O>(PhantomData<(E, O)>);

        impl<'de, E: Deserialize<'de>, O: Deserialize<'de>> Visitor<'de> for FrameVisitor<E, O> {
            type Value = WorkerFrame<E, O>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a worker frame `[]`, `[0]` or `[id, tag, ...]`")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let id: RequestId = match seq.next_element()? {
                    None => return Ok(WorkerFrame::Shutdown),
                    Some(id) => id,
                };
                if id == 0 {
                    if seq.next_element::<de::IgnoredAny>()?.is_some() {
                        return Err(de::Error::custom("readiness frame carries a payload"));
                    }
                    return Ok(WorkerFrame::Ready);
                }
                response_tail(id, &mut seq).map(WorkerFrame::Response)
            }
        }

        deserializer.deserialize_seq(FrameVisitor(PhantomData))
    }
}

/// Transport-level worker failure, as observed by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind} error: {message}")]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    /// The platform failed to create the backing worker.
    Spawn,
    /// A message could not be encoded for transport.
    Encode,
    /// An inbound frame could not be decoded.
    Decode,
    /// The transport rejected an outbound frame.
    Send,
    /// Abnormal termination or any other channel-level failure.
    Unknown,
}

impl fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            WorkerErrorKind::Spawn => "spawn",
            WorkerErrorKind::Encode => "encode",
            WorkerErrorKind::Decode => "decode",
            WorkerErrorKind::Send => "send",
            WorkerErrorKind::Unknown => "unknown",
        };
        f.write_str(kind)
    }
}

impl WorkerError {
    pub fn new(kind: WorkerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Spawn, message)
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Encode, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Decode, message)
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Send, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Unknown, message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}
