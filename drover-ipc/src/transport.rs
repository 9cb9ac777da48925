//! Byte transports for frame exchange
//!
//! Frames travel as newline-delimited JSON. `FrameReader` and `FrameWriter`
//! are the two directions over any async byte stream; `StdioTransport`
//! composes them over stdin/stdout for the worker side of a child process.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::IpcError;

/// Reads newline-delimited JSON frames from an async byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next frame. Returns `Ok(None)` on a clean end of stream.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        loop {
            self.line.clear();
            let read = self
                .inner
                .read_line(&mut self.line)
                .await
                .map_err(|e| IpcError::IoError(e.to_string()))?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            let frame: T = serde_json::from_str(trimmed)
                .map_err(|e| IpcError::DeserializationError(e.to_string()))?;
            return Ok(Some(frame));
        }
    }
}

/// Writes newline-delimited JSON frames to an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn write<T: Serialize>(&mut self, frame: &T) -> Result<(), IpcError> {
        let mut json =
            serde_json::to_string(frame).map_err(|e| IpcError::SerializationError(e.to_string()))?;
        json.push('\n');
        self.inner
            .write_all(json.as_bytes())
            .await
            .map_err(|e| IpcError::IoError(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| IpcError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Flush and shut down the underlying stream.
    pub async fn close(&mut self) -> Result<(), IpcError> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| IpcError::IoError(e.to_string()))?;
        Ok(())
    }
}

/// Stdin/stdout transport for the worker side of a child process.
pub struct StdioTransport {
    reader: FrameReader<tokio::io::Stdin>,
    writer: FrameWriter<tokio::io::Stdout>,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            reader: FrameReader::new(tokio::io::stdin()),
            writer: FrameWriter::new(tokio::io::stdout()),
        }
    }

    /// Split into the read and write halves.
    pub fn into_split(self) -> (FrameReader<tokio::io::Stdin>, FrameWriter<tokio::io::Stdout>) {
        (self.reader, self.writer)
    }

    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        self.reader.read().await
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<(), IpcError> {
        self.writer.write(frame).await
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}
