//! Wire protocol and transports for drover worker communication
//!
//! This crate defines the framing used between a host and its workers
//! (positional `[id, tag, payload?]` arrays with a `[0]` readiness
//! handshake) and the newline-delimited JSON transports that carry those
//! frames over byte streams such as a child process's stdio.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{Request, RequestId, Response, WorkerError, WorkerErrorKind, WorkerFrame};
pub use transport::{FrameReader, FrameWriter, StdioTransport};
