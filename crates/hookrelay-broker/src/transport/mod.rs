//! Byte-stream transports carrying MQTT traffic.
//!
//! The broker client frames packets itself; a transport only moves raw bytes
//! in order. Every operation takes a timeout and a cancellation token, and
//! works on an `offset`/`length` range of the caller's buffer.

mod tcp;
mod websocket;

pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use std::future::Future;
use std::ops::Range;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Minimal full-duplex byte stream.
///
/// `send` and `receive` may run concurrently from different tasks; sends are
/// serialized so bytes of two sends never interleave.
#[async_trait]
pub trait Duplex: Send + Sync {
    /// Open the connection.
    async fn connect(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()>;

    /// Write `buffer[offset..offset + length]`.
    async fn send(
        &self,
        buffer: &[u8],
        offset: usize,
        length: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Read at most `length` bytes into `buffer[offset..]`, returning the count.
    async fn receive(
        &self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize>;

    /// Close the connection gracefully.
    async fn disconnect(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()>;

    /// Release the underlying socket. Idempotent.
    fn dispose(&self);
}

/// Validate a byte range against a buffer length.
pub(crate) fn checked_range(capacity: usize, offset: usize, length: usize) -> Result<Range<usize>> {
    offset
        .checked_add(length)
        .filter(|end| *end <= capacity)
        .map(|end| offset..end)
        .ok_or(TransportError::InvalidRange {
            offset,
            length,
            capacity,
        })
}

/// Connection state shared by the transport implementations: independently
/// locked read and write halves plus a disposal token.
pub(crate) struct Link<R, W> {
    pub(crate) reader: Mutex<Option<R>>,
    pub(crate) writer: Mutex<Option<W>>,
    disposed: CancellationToken,
}

impl<R: Send, W: Send> Link<R, W> {
    pub(crate) fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            disposed: CancellationToken::new(),
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed.is_cancelled() {
            Err(TransportError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Store freshly connected halves, replacing any previous connection.
    pub(crate) async fn install(&self, reader: R, writer: W) {
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
    }

    /// Run `operation` bounded by `timeout`, the caller's token and disposal.
    pub(crate) async fn run<T, F>(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_live()?;
        let result = tokio::select! {
            biased;
            () = self.disposed.cancelled() => Err(TransportError::Disposed),
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            outcome = tokio::time::timeout(timeout, operation) => {
                outcome.unwrap_or(Err(TransportError::Timeout(timeout)))
            }
        };
        if matches!(result, Err(TransportError::Disposed)) {
            // The aborted operation released its lock; drop the halves now.
            self.release();
        }
        result
    }

    /// Drop whichever halves are not currently in use.
    fn release(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    pub(crate) fn dispose(&self) {
        self.disposed.cancel();
        self.release();
    }
}
