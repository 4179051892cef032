//! Broker connection settings.

use crate::error::TransportError;
use crate::transport::{Duplex, TcpTransport, WebSocketTransport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Which transport carries the MQTT session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// WebSocket with injected access headers.
    #[default]
    Websocket,
    /// Plain TCP socket.
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Websocket => write!(f, "websocket"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Access client id and secret presented to the reverse proxy.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredentials {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

impl AccessCredentials {
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Both values are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

impl fmt::Debug for AccessCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open the broker session.
#[derive(Clone)]
pub struct BrokerOptions {
    /// Broker address; form depends on the transport.
    pub address: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Start without stored session state.
    pub clean_session: bool,
    /// Interval between keep-alive pings.
    pub keep_alive: Duration,
    /// Bound on transport connect plus CONNECT/CONNACK.
    pub connect_timeout: Duration,
    /// Bound on a single publish, including the broker acknowledgement.
    pub publish_timeout: Duration,
    /// Largest incoming packet accepted.
    pub max_packet_size: usize,
    pub transport: TransportKind,
    /// Required for the WebSocket transport.
    pub access: Option<AccessCredentials>,
}

impl BrokerOptions {
    /// Options with defaults for everything but the address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client_id: "devops-listener".to_string(),
            username: None,
            password: None,
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            max_packet_size: 256 * 1024,
            transport: TransportKind::default(),
            access: None,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_access(mut self, access: AccessCredentials) -> Self {
        self.access = Some(access);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Build the configured transport.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidAddress` for an unusable address, or
    /// `TransportError::InvalidHeader` when the WebSocket transport has no
    /// usable access credentials.
    pub fn build_transport(&self) -> Result<Arc<dyn Duplex>, TransportError> {
        match self.transport {
            TransportKind::Tcp => Ok(Arc::new(TcpTransport::new(&self.address)?)),
            TransportKind::Websocket => {
                let access = self
                    .access
                    .as_ref()
                    .filter(|a| a.is_complete())
                    .ok_or_else(|| {
                        TransportError::InvalidHeader("access credentials are required".to_string())
                    })?;
                Ok(Arc::new(WebSocketTransport::new(&self.address, access)?))
            }
        }
    }
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("address", &self.address)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .field("transport", &self.transport)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}
