//! Error types for the broker client and transports.

use rumqttc::mqttbytes::QoS;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised by a [`crate::Duplex`] transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker address cannot be used by this transport.
    #[error("invalid broker address '{0}'")]
    InvalidAddress(String),

    /// An access header value is not a valid HTTP header value.
    #[error("invalid access header: {0}")]
    InvalidHeader(String),

    /// The WebSocket upgrade was rejected or failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] Box<tungstenite::Error>),

    /// A WebSocket error after the handshake completed.
    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent data that does not fit the byte-stream contract.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// The requested byte range does not fit in the buffer.
    #[error("range {offset}+{length} exceeds buffer of {capacity} bytes")]
    InvalidRange {
        offset: usize,
        length: usize,
        capacity: usize,
    },

    /// The operation did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// `connect` has not completed.
    #[error("transport not connected")]
    NotConnected,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// The transport was disposed.
    #[error("transport disposed")]
    Disposed,
}

/// Errors establishing the broker session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport could not be opened or failed during the handshake.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The broker answered CONNECT with a failure code.
    #[error("broker refused connection: {0}")]
    Refused(String),

    /// The broker answered with something other than CONNACK.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors publishing a message.
#[derive(Debug, Error)]
pub enum PublishError {
    /// No broker session is established.
    #[error("broker client is not connected")]
    NotConnected,

    /// The topic is not a valid publish topic.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Only QoS 0 and 1 are supported.
    #[error("unsupported qos {0:?}")]
    UnsupportedQos(QoS),

    /// The packet could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Sending failed, timed out, was cancelled, or the session closed before
    /// the broker acknowledged.
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
}
