//! Plain TCP transport.

use super::{Duplex, Link, Result, checked_range};
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unencrypted socket to `host:port`, for brokers reachable without a proxy.
pub struct TcpTransport {
    address: String,
    link: Link<OwnedReadHalf, OwnedWriteHalf>,
}

impl TcpTransport {
    /// Create a transport for `host:port`, optionally prefixed with `tcp://`
    /// or `mqtt://`.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidAddress` if the address has another
    /// scheme or lacks a port.
    pub fn new(address: &str) -> Result<Self> {
        let bare = address
            .strip_prefix("tcp://")
            .or_else(|| address.strip_prefix("mqtt://"))
            .unwrap_or(address)
            .trim_end_matches('/');

        let has_port = bare
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if bare.contains("://") || !has_port {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }

        Ok(Self {
            address: bare.to_string(),
            link: Link::new(),
        })
    }

    /// The `host:port` this transport connects to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Duplex for TcpTransport {
    async fn connect(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let stream = self
            .link
            .run(timeout, cancel, async {
                Ok::<_, TransportError>(TcpStream::connect(&self.address).await?)
            })
            .await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        self.link.install(reader, writer).await;
        debug!(address = %self.address, "TCP transport connected");
        Ok(())
    }

    async fn send(
        &self,
        buffer: &[u8],
        offset: usize,
        length: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let range = checked_range(buffer.len(), offset, length)?;
        self.link
            .run(timeout, cancel, async {
                let mut guard = self.link.writer.lock().await;
                let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
                writer.write_all(&buffer[range]).await?;
                writer.flush().await?;
                Ok::<_, TransportError>(())
            })
            .await
    }

    async fn receive(
        &self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let range = checked_range(buffer.len(), offset, length)?;
        if range.is_empty() {
            return Ok(0);
        }
        self.link
            .run(timeout, cancel, async {
                let mut guard = self.link.reader.lock().await;
                let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;
                match reader.read(&mut buffer[range]).await? {
                    0 => Err(TransportError::Closed),
                    n => Ok(n),
                }
            })
            .await
    }

    async fn disconnect(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        self.link
            .run(timeout, cancel, async {
                if let Some(mut writer) = self.link.writer.lock().await.take() {
                    writer.shutdown().await?;
                }
                Ok::<_, TransportError>(())
            })
            .await
    }

    fn dispose(&self) {
        self.link.dispose();
    }
}
