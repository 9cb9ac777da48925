//! IPC error types

use thiserror::Error;

use crate::protocol::{WorkerError, WorkerErrorKind};

/// Transport-level IPC errors.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
}

impl IpcError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, IpcError::IoError(_) | IpcError::ConnectionClosed)
    }

    /// Check if this error indicates a protocol-level fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::SerializationError(_) | IpcError::DeserializationError(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}

impl From<IpcError> for WorkerError {
    fn from(err: IpcError) -> Self {
        let kind = match &err {
            IpcError::SerializationError(_) => WorkerErrorKind::Encode,
            IpcError::DeserializationError(_) => WorkerErrorKind::Decode,
            IpcError::IoError(_) => WorkerErrorKind::Send,
            IpcError::ConnectionClosed => WorkerErrorKind::Unknown,
        };
        WorkerError::new(kind, err.to_string())
    }
}
