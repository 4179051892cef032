//! Long-lived MQTT session over a [`Duplex`] transport.
//!
//! The client frames MQTT 3.1.1 packets itself and hands raw bytes to the
//! transport. Once connected, two background tasks own the wire:
//!
//! - the writer drains a single outgoing queue (publishes, keep-alive pings),
//!   so frames from concurrent publishers never interleave and a publisher
//!   that gives up does not leave half a frame on the socket;
//! - the reader decodes broker packets and completes the waiter of each
//!   PUBACK by packet id.
//!
//! Either task failing closes the session; later publishes fail with
//! [`PublishError::NotConnected`]. There is no automatic reconnect.

use crate::error::{ConnectError, PublishError, TransportError};
use crate::options::BrokerOptions;
use crate::topic::validate_topic;
use crate::transport::Duplex;
use async_trait::async_trait;
use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{
    self, Connect, ConnectReturnCode, Disconnect, Packet, PingReq, PingResp, Publish,
};
use rumqttc::mqttbytes::{self, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the outgoing packet queue.
const OUTGOING_QUEUE: usize = 64;
/// Bytes requested from the transport per receive.
const READ_CHUNK: usize = 4096;

/// Publishing seam used by the HTTP layer.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` to `topic`.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError>;

    /// Whether a broker session is currently established.
    fn is_connected(&self) -> bool;
}

struct Outgoing {
    bytes: Vec<u8>,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// State of one established session, shared with the background tasks.
struct Session {
    transport: Arc<dyn Duplex>,
    outgoing: mpsc::Sender<Outgoing>,
    pending: Mutex<HashMap<u16, oneshot::Sender<()>>>,
    closed: CancellationToken,
}

impl Session {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn close(&self) {
        self.closed.cancel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn register(&self, pkid: u16) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pkid, tx);
        rx
    }

    fn forget(&self, pkid: u16) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pkid);
    }

    fn acknowledge(&self, pkid: u16) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pkid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => debug!(pkid, "PUBACK for unknown packet id"),
        }
    }

    /// Queue bytes for the writer and wait until they are on the wire.
    async fn submit(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let (done, written) = oneshot::channel();
        self.outgoing
            .send(Outgoing { bytes, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        written.await.unwrap_or(Err(TransportError::Closed))
    }
}

/// Accumulates transport bytes until a whole packet can be decoded.
struct PacketReader {
    buffer: BytesMut,
    chunk: Vec<u8>,
    max_packet_size: usize,
}

impl PacketReader {
    fn new(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK),
            chunk: vec![0; READ_CHUNK],
            max_packet_size,
        }
    }

    async fn next(
        &mut self,
        transport: &dyn Duplex,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Packet, TransportError> {
        loop {
            match v4::read(&mut self.buffer, self.max_packet_size) {
                Ok(packet) => return Ok(packet),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(TransportError::Malformed(e.to_string())),
            }
            let count = transport
                .receive(&mut self.chunk, 0, READ_CHUNK, timeout, cancel)
                .await?;
            self.buffer.extend_from_slice(&self.chunk[..count]);
        }
    }
}

/// Frame one packet, refusing anything larger than `max_packet_size`.
fn encode(packet: &Packet, max_packet_size: usize) -> Result<Vec<u8>, String> {
    let mut buffer = BytesMut::new();
    let written = match packet {
        Packet::Connect(connect) => connect.write(&mut buffer),
        Packet::ConnAck(ack) => ack.write(&mut buffer),
        Packet::Publish(publish) => publish.write(&mut buffer),
        Packet::PubAck(ack) => ack.write(&mut buffer),
        Packet::PingReq => PingReq.write(&mut buffer),
        Packet::PingResp => PingResp.write(&mut buffer),
        Packet::Disconnect => Disconnect.write(&mut buffer),
        other => return Err(format!("cannot encode {other:?}")),
    };
    let size = written.map_err(|e| e.to_string())?;
    if size > max_packet_size {
        return Err(format!(
            "packet of {size} bytes exceeds the {max_packet_size} byte limit"
        ));
    }
    Ok(buffer.to_vec())
}

async fn write_loop(
    session: Arc<Session>,
    mut queue: mpsc::Receiver<Outgoing>,
    ping: Vec<u8>,
    keep_alive: Duration,
    write_timeout: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let (bytes, done) = tokio::select! {
            biased;
            () = session.closed.cancelled() => break,
            Some(item) = queue.recv() => (item.bytes, Some(item.done)),
            _ = ticker.tick() => {
                trace!("Sending PINGREQ");
                (ping.clone(), None)
            }
        };

        let result = session
            .transport
            .send(&bytes, 0, bytes.len(), write_timeout, &session.closed)
            .await;
        if let Err(e) = &result {
            if session.is_open() {
                error!(error = %e, "Broker write failed, closing session");
                session.close();
            }
        }
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }

    queue.close();
    while let Ok(item) = queue.try_recv() {
        let _ = item.done.send(Err(TransportError::Closed));
    }
}

async fn read_loop(session: Arc<Session>, mut reader: PacketReader, idle_timeout: Duration) {
    loop {
        match reader
            .next(session.transport.as_ref(), idle_timeout, &session.closed)
            .await
        {
            Ok(Packet::PubAck(ack)) => session.acknowledge(ack.pkid),
            Ok(Packet::PingResp) => trace!("PINGRESP received"),
            Ok(packet) => debug!(?packet, "Ignoring unexpected packet from broker"),
            Err(TransportError::Cancelled) => break,
            Err(e) => {
                if session.is_open() {
                    error!(error = %e, "Broker connection lost");
                    session.close();
                }
                break;
            }
        }
    }
}

/// MQTT client owning one broker session for the life of the process.
pub struct BrokerClient {
    options: BrokerOptions,
    transport: Arc<dyn Duplex>,
    session: RwLock<Option<Arc<Session>>>,
    next_pkid: AtomicU16,
}

impl BrokerClient {
    /// Create a client over an existing transport. Nothing is connected yet.
    #[must_use]
    pub fn new(options: BrokerOptions, transport: Arc<dyn Duplex>) -> Self {
        Self {
            options,
            transport,
            session: RwLock::new(None),
            next_pkid: AtomicU16::new(1),
        }
    }

    /// Create a client with the transport selected by `options`.
    ///
    /// # Errors
    /// Returns `TransportError` if the transport cannot be built.
    pub fn from_options(options: BrokerOptions) -> Result<Self, TransportError> {
        let transport = options.build_transport()?;
        Ok(Self::new(options, transport))
    }

    #[must_use]
    pub const fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Whether a session is established and still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|session| session.is_open())
            .cloned()
    }

    fn next_packet_id(&self) -> u16 {
        loop {
            let pkid = self.next_pkid.fetch_add(1, Ordering::Relaxed);
            if pkid != 0 {
                return pkid;
            }
        }
    }

    fn connect_packet(&self) -> Connect {
        let mut connect = Connect::new(self.options.client_id.clone());
        connect.keep_alive = u16::try_from(self.options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        connect.clean_session = self.options.clean_session;
        if let Some(username) = &self.options.username {
            connect.set_login(
                username.clone(),
                self.options.password.clone().unwrap_or_default(),
            );
        }
        connect
    }

    /// Open the transport and establish the MQTT session.
    ///
    /// Calling this while connected is a no-op.
    ///
    /// # Errors
    /// Returns `ConnectError::Transport` if the transport cannot be opened,
    /// `ConnectError::Refused` if the broker rejects the credentials or client
    /// id, and `ConnectError::Protocol` for an unexpected reply.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }

        info!(
            address = %self.options.address,
            client_id = %self.options.client_id,
            transport = %self.options.transport,
            "Connecting to MQTT broker"
        );

        let reader = match self.handshake(cancel).await {
            Ok(reader) => reader,
            Err(e) => {
                error!(error = %e, "Failed to connect to MQTT broker");
                let _ = self
                    .transport
                    .disconnect(self.options.connect_timeout, &CancellationToken::new())
                    .await;
                return Err(e);
            }
        };

        let max = self.options.max_packet_size;
        let ping = encode(&Packet::PingReq, max).map_err(ConnectError::Protocol)?;
        let keep_alive = self.options.keep_alive.max(Duration::from_secs(1));
        let (outgoing, queue) = mpsc::channel(OUTGOING_QUEUE);
        let session = Arc::new(Session {
            transport: Arc::clone(&self.transport),
            outgoing,
            pending: Mutex::default(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            Arc::clone(&session),
            queue,
            ping,
            keep_alive,
            self.options.publish_timeout,
        ));
        tokio::spawn(read_loop(Arc::clone(&session), reader, keep_alive * 2));

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        info!("The MQTT client is connected");
        Ok(())
    }

    async fn handshake(&self, cancel: &CancellationToken) -> Result<PacketReader, ConnectError> {
        let timeout = self.options.connect_timeout;
        let max = self.options.max_packet_size;

        self.transport.connect(timeout, cancel).await?;

        let bytes = encode(&Packet::Connect(self.connect_packet()), max)
            .map_err(ConnectError::Protocol)?;
        self.transport
            .send(&bytes, 0, bytes.len(), timeout, cancel)
            .await?;

        let mut reader = PacketReader::new(max);
        match reader.next(self.transport.as_ref(), timeout, cancel).await? {
            Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                debug!(session_present = ack.session_present, "CONNACK received");
                Ok(reader)
            }
            Packet::ConnAck(ack) => Err(ConnectError::Refused(format!("{:?}", ack.code))),
            other => Err(ConnectError::Protocol(format!(
                "expected CONNACK, received {other:?}"
            ))),
        }
    }

    /// Publish a message.
    ///
    /// With `QoS::AtLeastOnce` this waits for the broker's PUBACK; with
    /// `QoS::AtMostOnce` it returns once the packet is written. The whole
    /// operation is bounded by the configured publish timeout.
    ///
    /// # Errors
    /// Returns `PublishError::NotConnected` without an open session,
    /// `PublishError::InvalidTopic` or `PublishError::UnsupportedQos` for bad
    /// arguments, and `PublishError::TransportFailure` if the write fails, the
    /// acknowledgement does not arrive in time, `cancel` fires, or the session
    /// closes first.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        validate_topic(topic)?;
        if qos == QoS::ExactlyOnce {
            return Err(PublishError::UnsupportedQos(qos));
        }
        let session = self.current().ok_or(PublishError::NotConnected)?;

        let size = payload.len();
        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;
        let pkid = (qos == QoS::AtLeastOnce).then(|| self.next_packet_id());
        if let Some(pkid) = pkid {
            publish.pkid = pkid;
        }

        let bytes = encode(&Packet::Publish(publish), self.options.max_packet_size)
            .map_err(PublishError::Encode)?;
        let ack = pkid.map(|pkid| session.register(pkid));

        let timeout = self.options.publish_timeout;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            () = session.closed.cancelled() => Err(TransportError::Closed),
            result = tokio::time::timeout(timeout, deliver(&session, bytes, ack)) => {
                result.unwrap_or(Err(TransportError::Timeout(timeout)))
            }
        };

        match outcome {
            Ok(()) => {
                debug!(topic, ?pkid, bytes = size, retain, "Published message");
                Ok(())
            }
            Err(e) => {
                if let Some(pkid) = pkid {
                    session.forget(pkid);
                }
                warn!(topic, ?pkid, error = %e, "Publish failed");
                Err(PublishError::TransportFailure(e))
            }
        }
    }

    /// Send DISCONNECT, close the transport and release it.
    ///
    /// # Errors
    /// Returns `TransportError` if the transport does not close cleanly; the
    /// transport is released either way.
    pub async fn disconnect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(session) = session.filter(|s| s.is_open()) {
            match encode(&Packet::Disconnect, self.options.max_packet_size) {
                Ok(bytes) => {
                    let sent =
                        tokio::time::timeout(self.options.publish_timeout, session.submit(bytes))
                            .await;
                    if !matches!(sent, Ok(Ok(()))) {
                        warn!("Could not send DISCONNECT to broker");
                    }
                }
                Err(e) => warn!(error = %e, "Could not encode DISCONNECT"),
            }
            session.close();
        }

        let result = self
            .transport
            .disconnect(self.options.connect_timeout, cancel)
            .await;
        self.transport.dispose();
        info!("Disconnected from MQTT broker");
        result
    }
}

async fn deliver(
    session: &Session,
    bytes: Vec<u8>,
    ack: Option<oneshot::Receiver<()>>,
) -> Result<(), TransportError> {
    session.submit(bytes).await?;
    if let Some(ack) = ack {
        ack.await.map_err(|_| TransportError::Closed)?;
    }
    Ok(())
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        if let Some(session) = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            session.close();
        }
        self.transport.dispose();
    }
}

#[async_trait]
impl Publisher for BrokerClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        Self::publish(self, topic, payload, qos, retain, cancel).await
    }

    fn is_connected(&self) -> bool {
        Self::is_connected(self)
    }
}
