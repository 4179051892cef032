//! MQTT publishing over pluggable byte-stream transports.
//!
//! - `transport`: the `Duplex` capability and its TCP and header-injecting
//!   WebSocket implementations
//! - `client`: a long-lived MQTT session that frames packets on top of a transport
//! - `options`: connection settings and transport selection

pub mod client;
pub mod error;
pub mod options;
pub mod topic;
pub mod transport;

pub use client::{BrokerClient, Publisher};
pub use error::{ConnectError, PublishError, TransportError};
pub use options::{AccessCredentials, BrokerOptions, TransportKind};
pub use rumqttc::mqttbytes::QoS;
pub use topic::validate_topic;
pub use transport::{Duplex, TcpTransport, WebSocketTransport};
