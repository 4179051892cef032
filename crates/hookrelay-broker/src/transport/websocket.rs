//! WebSocket transport for brokers behind an authenticating reverse proxy.
//!
//! The two access headers are attached to the upgrade request so the proxy
//! admits the connection; past the handshake the socket carries MQTT bytes
//! in binary frames.

use super::{Duplex, Link, Result, checked_range};
use crate::error::TransportError;
use crate::options::AccessCredentials;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Header carrying the access client identifier.
pub const ACCESS_CLIENT_ID_HEADER: &str = "cf-access-client-id";
/// Header carrying the access client secret.
pub const ACCESS_CLIENT_SECRET_HEADER: &str = "cf-access-client-secret";
/// Subprotocol MQTT brokers expect on WebSocket listeners.
const MQTT_SUBPROTOCOL: &str = "mqtt";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half plus bytes of the last frame not yet handed to the caller.
pub(crate) struct FrameReader {
    stream: SplitStream<Socket>,
    pending: Bytes,
}

/// WebSocket (`ws://` or `wss://`) transport injecting access headers.
pub struct WebSocketTransport {
    url: Url,
    headers: Vec<(HeaderName, HeaderValue)>,
    link: Link<FrameReader, SplitSink<Socket, Message>>,
}

impl WebSocketTransport {
    /// Create a transport for `address`. An address without a scheme is
    /// treated as `wss://`.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidAddress` for unparseable or non-WebSocket
    /// addresses and `TransportError::InvalidHeader` if a credential is not a
    /// valid header value.
    pub fn new(address: &str, access: &AccessCredentials) -> Result<Self> {
        let url = parse_address(address)?;
        let headers = vec![
            (
                HeaderName::from_static(ACCESS_CLIENT_ID_HEADER),
                header_value(&access.client_id)?,
            ),
            (
                HeaderName::from_static(ACCESS_CLIENT_SECRET_HEADER),
                header_value(&access.client_secret)?,
            ),
        ];
        Ok(Self {
            url,
            headers,
            link: Link::new(),
        })
    }

    /// The resolved broker URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    fn upgrade_request(&self) -> Result<Request<()>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {e}", self.url)))?;
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(MQTT_SUBPROTOCOL),
        );
        Ok(request)
    }
}

fn parse_address(address: &str) -> Result<Url> {
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("wss://{address}")
    };
    let url = Url::parse(&candidate)
        .map_err(|e| TransportError::InvalidAddress(format!("{address}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" if url.host_str().is_some() => Ok(url),
        _ => Err(TransportError::InvalidAddress(address.to_string())),
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    let mut header =
        HeaderValue::from_str(value).map_err(|e| TransportError::InvalidHeader(e.to_string()))?;
    header.set_sensitive(true);
    Ok(header)
}

fn websocket_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Io(io) => TransportError::Io(io),
        other => TransportError::WebSocket(Box::new(other)),
    }
}

#[async_trait]
impl Duplex for WebSocketTransport {
    async fn connect(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let request = self.upgrade_request()?;
        let (socket, response) = self
            .link
            .run(timeout, cancel, async {
                connect_async(request)
                    .await
                    .map_err(|e| TransportError::Handshake(Box::new(e)))
            })
            .await?;
        debug!(
            url = %self.url,
            status = %response.status(),
            "WebSocket transport connected"
        );

        let (sink, stream) = socket.split();
        self.link
            .install(
                FrameReader {
                    stream,
                    pending: Bytes::new(),
                },
                sink,
            )
            .await;
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
                let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
                sink.send(Message::Binary(buffer[range].to_vec()))
                    .await
                    .map_err(websocket_error)
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
                while reader.pending.is_empty() {
                    match reader.stream.next().await {
                        Some(Ok(Message::Binary(data))) => reader.pending = Bytes::from(data),
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Text(_))) => {
                            return Err(TransportError::Malformed(
                                "text frame on an MQTT connection".to_string(),
                            ));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "WebSocket closed by peer");
                            return Err(TransportError::Closed);
                        }
                        Some(Err(e)) => return Err(websocket_error(e)),
                        None => return Err(TransportError::Closed),
                    }
                }
                let target = &mut buffer[range];
                let count = target.len().min(reader.pending.len());
                target[..count].copy_from_slice(&reader.pending[..count]);
                reader.pending.advance(count);
                Ok(count)
            })
            .await
    }

    async fn disconnect(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        self.link
            .run(timeout, cancel, async {
                if let Some(mut sink) = self.link.writer.lock().await.take() {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        warn!(error = %e, "Failed to send WebSocket close frame");
                    }
                    sink.close().await.map_err(websocket_error)?;
                }
                Ok::<_, TransportError>(())
            })
            .await
    }

    fn dispose(&self) {
        self.link.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn credentials() -> AccessCredentials {
        AccessCredentials::new("client-id.access", "s3cr3t")
    }

    #[test]
    fn test_address_defaults_to_wss() {
        let transport =
            WebSocketTransport::new("emqx.adamdixon.dev:8083/mqtt", &credentials()).unwrap();
        assert_eq!(transport.url().as_str(), "wss://emqx.adamdixon.dev:8083/mqtt");

        let transport = WebSocketTransport::new("ws://127.0.0.1:9001/mqtt", &credentials()).unwrap();
        assert_eq!(transport.url().scheme(), "ws");
    }

    #[test]
    fn test_rejects_non_websocket_address() {
        let result = WebSocketTransport::new("tcp://broker:1883", &credentials());
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }

    #[test]
    fn test_rejects_invalid_header_value() {
        let result = WebSocketTransport::new(
            "ws://broker/mqtt",
            &AccessCredentials::new("id", "line\nbreak"),
        );
        assert!(matches!(result, Err(TransportError::InvalidHeader(_))));
    }

    #[tokio::test]
    async fn test_handshake_carries_access_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}/mqtt", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut ws = accept_hdr_async(stream, |req: &ServerRequest, mut resp: Response| {
                for name in [ACCESS_CLIENT_ID_HEADER, ACCESS_CLIENT_SECRET_HEADER] {
                    let value = req.headers().get(name).unwrap().to_str().unwrap();
                    seen.push(value.to_string());
                }
                resp.headers_mut().insert(
                    "sec-websocket-protocol",
                    HeaderValue::from_static(MQTT_SUBPROTOCOL),
                );
                Ok::<_, ErrorResponse>(resp)
            })
            .await
            .unwrap();

            // One inbound frame, echoed back split across two frames.
            let frame = ws.next().await.unwrap().unwrap();
            let data = frame.into_data();
            let (head, tail) = data.split_at(2);
            ws.send(Message::Binary(head.to_vec())).await.unwrap();
            ws.send(Message::Binary(tail.to_vec())).await.unwrap();
            ws.close(None).await.unwrap();
            seen
        });

        let cancel = CancellationToken::new();
        let transport = WebSocketTransport::new(&address, &credentials()).unwrap();
        transport.connect(TIMEOUT, &cancel).await.unwrap();
        transport.send(b"__mqtt__", 2, 4, TIMEOUT, &cancel).await.unwrap();

        let mut buf = [0u8; 4];
        let first = transport.receive(&mut buf, 0, 1, TIMEOUT, &cancel).await.unwrap();
        assert_eq!(first, 1);
        let mut read = first;
        while read < 4 {
            read += transport
                .receive(&mut buf, read, 4 - read, TIMEOUT, &cancel)
                .await
                .unwrap();
        }
        assert_eq!(&buf, b"mqtt");

        let result = transport.receive(&mut buf, 0, 4, TIMEOUT, &cancel).await;
        assert!(matches!(result, Err(TransportError::Closed)));

        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["client-id.access".to_string(), "s3cr3t".to_string()]);
        transport.dispose();
    }

    #[tokio::test]
    async fn test_rejected_upgrade_is_a_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}/mqtt", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = accept_hdr_async(stream, |_: &ServerRequest, _: Response| {
                let mut denied = ErrorResponse::new(None);
                *denied.status_mut() = tungstenite::http::StatusCode::FORBIDDEN;
                Err::<Response, _>(denied)
            })
            .await;
        });

        let transport = WebSocketTransport::new(&address, &credentials()).unwrap();
        let result = transport.connect(TIMEOUT, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }
}
