//! Device-command server
//!
//! Owns one persistent, bidirectional connection per device: handshake on
//! accept, a reader/writer task pair per connection, bounded-retry command
//! delivery, and liveness detection. State changes are published on a
//! [`ServerEvent`] broadcast channel.

mod events;
mod pending;
mod state;

pub use events::ServerEvent;
pub use pending::{PendingAcks, PendingCommand, SweepOutcome};
pub use state::{ConnectionStats, DeviceHandle, NetworkQuality, NetworkStatistics, RateLimiter};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::SyncError;
use crate::protocol::{
    decode_message, encode_message, framed, unix_now, CommandKind, CommandParameters,
    HandshakeReply, WireMessage,
};
use crate::types::{CommandServerConfig, DeviceInfo};

/// How long a fresh connection gets to present its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound queue depth per device
const OUTBOUND_QUEUE: usize = 64;

/// Capabilities this server can drive on a device
const SUPPORTED_CAPABILITIES: &[&str] = &[
    "recording",
    "streaming",
    "calibration",
    "thermal_imaging",
    "gsr_monitoring",
    "audio_capture",
];

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;

/// Generate a random 128-bit hex message ID
fn new_message_id() -> String {
    let id: u128 = rand::thread_rng().r#gen();
    format!("{id:032x}")
}

struct ServerInner {
    config: CommandServerConfig,
    devices: RwLock<HashMap<String, DeviceHandle>>,
    pending: Mutex<PendingAcks>,
    limiter: Mutex<RateLimiter>,
    event_tx: broadcast::Sender<ServerEvent>,
    device_counter: AtomicU64,
}

impl ServerInner {
    /// Remove a device, its pending commands, and announce the departure
    async fn deregister(&self, device_id: &str, reason: &str) {
        let removed = self.devices.write().await.remove(device_id);
        if removed.is_none() {
            return;
        }
        self.pending.lock().await.remove_device(device_id);
        tracing::info!("device {} disconnected: {}", device_id, reason);
        let _ = self.event_tx.send(ServerEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Dispatch one inbound message; returns false when the connection
    /// should close
    async fn ingest(&self, device_id: &str, message: WireMessage, size: usize) -> bool {
        {
            let mut devices = self.devices.write().await;
            let Some(handle) = devices.get_mut(device_id) else {
                return false;
            };
            handle.last_seen = Instant::now();
            handle.stats.record_received(size);
        }

        match message {
            WireMessage::Heartbeat { .. } => {
                tracing::debug!("heartbeat from {}", device_id);
                true
            }
            WireMessage::Acknowledgment {
                ref message_id,
                success,
                ..
            } => {
                if !success {
                    tracing::warn!("device {} rejected command {}", device_id, message_id);
                }
                let resolved = self.pending.lock().await.resolve(message_id);
                match resolved {
                    Some((entry, latency_ms)) => {
                        if let Some(handle) = self.devices.write().await.get_mut(device_id) {
                            handle.stats.record_latency(latency_ms);
                        }
                        tracing::debug!(
                            "ack for {} from {} ({:.1}ms)",
                            entry.message_id,
                            device_id,
                            latency_ms
                        );
                        let _ = self.event_tx.send(ServerEvent::CommandAcknowledged {
                            device_id: device_id.to_string(),
                            message_id: entry.message_id,
                            latency_ms,
                        });
                    }
                    None => {
                        tracing::debug!("ack for unknown message {} from {}", message_id, device_id);
                    }
                }
                true
            }
            WireMessage::Disconnect { reason, .. } => {
                self.deregister(device_id, &reason).await;
                false
            }
            WireMessage::Handshake { .. } => {
                tracing::warn!("duplicate handshake from {}, ignoring", device_id);
                true
            }
            WireMessage::Error { ref error, .. } => {
                tracing::error!("device {} error: {}", device_id, error);
                let _ = self.event_tx.send(ServerEvent::Message {
                    device_id: device_id.to_string(),
                    message,
                });
                true
            }
            WireMessage::CapabilityResponse {
                ref capabilities, ..
            } => {
                if let Some(handle) = self.devices.write().await.get_mut(device_id) {
                    handle.capabilities = capabilities.clone();
                }
                let _ = self.event_tx.send(ServerEvent::Message {
                    device_id: device_id.to_string(),
                    message,
                });
                true
            }
            other => {
                tracing::debug!("received {} from {}", other.kind(), device_id);
                let _ = self.event_tx.send(ServerEvent::Message {
                    device_id: device_id.to_string(),
                    message: other,
                });
                true
            }
        }
    }
}

/// Cheap, cloneable handle for sending to and querying connected devices
#[derive(Clone)]
pub struct CommandHandle {
    inner: Arc<ServerInner>,
}

impl CommandHandle {
    /// Subscribe to server events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Send a raw message to a device without delivery tracking
    ///
    /// # Errors
    /// Returns `DeviceNotFound` for unknown devices and `Disconnected` when
    /// the connection died underneath the send.
    pub async fn send_message(
        &self,
        device_id: &str,
        message: WireMessage,
    ) -> Result<(), SyncError> {
        let outbound = {
            let devices = self.inner.devices.read().await;
            let handle = devices
                .get(device_id)
                .ok_or_else(|| SyncError::DeviceNotFound {
                    device_id: device_id.to_string(),
                })?;
            handle.outbound.clone()
        };

        if outbound.send(message).await.is_err() {
            self.inner.deregister(device_id, "send channel closed").await;
            return Err(SyncError::Disconnected {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    /// Send a command, optionally tracking it until acknowledged
    ///
    /// Returns the command's message ID. With `require_ack`, the command is
    /// retried on timeout up to the configured attempt budget; exhaustion is
    /// reported as [`ServerEvent::DeliveryFailed`].
    ///
    /// # Errors
    /// Returns `DeviceNotFound`, `RateLimited`, or `Disconnected`.
    pub async fn send_command(
        &self,
        device_id: &str,
        command: CommandKind,
        parameters: CommandParameters,
        require_ack: bool,
    ) -> Result<String, SyncError> {
        let (outbound, source) = {
            let devices = self.inner.devices.read().await;
            let handle = devices
                .get(device_id)
                .ok_or_else(|| SyncError::DeviceNotFound {
                    device_id: device_id.to_string(),
                })?;
            (handle.outbound.clone(), handle.addr.ip())
        };

        if !self.inner.limiter.lock().await.check(source) {
            return Err(SyncError::RateLimited {
                addr: source.to_string(),
            });
        }

        let message_id = new_message_id();
        let message = WireMessage::Command {
            command,
            parameters: parameters.clone(),
            timestamp: unix_now(),
            message_id: message_id.clone(),
            require_ack,
            retry_attempt: None,
        };

        if outbound.send(message).await.is_err() {
            self.inner.deregister(device_id, "send channel closed").await;
            return Err(SyncError::Disconnected {
                device_id: device_id.to_string(),
            });
        }

        if require_ack {
            self.inner.pending.lock().await.register(
                &message_id,
                device_id,
                command,
                parameters,
            );
        }

        tracing::debug!(
            "command {} sent to {} (msg_id={})",
            command.as_str(),
            device_id,
            message_id
        );
        Ok(message_id)
    }

    /// Send a command to every connected device; returns the success count
    pub async fn broadcast_command(
        &self,
        command: CommandKind,
        parameters: CommandParameters,
        require_ack: bool,
    ) -> usize {
        let device_ids = self.connected_devices().await;
        let mut sent = 0;
        for device_id in device_ids {
            if self
                .send_command(&device_id, command, parameters.clone(), require_ack)
                .await
                .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }

    /// Intersect the requested capabilities with what the server and device
    /// both support, and tell the device which ones the server will use
    ///
    /// # Errors
    /// Returns `DeviceNotFound` or a send failure.
    pub async fn negotiate_capabilities(
        &self,
        device_id: &str,
        requested: &[String],
    ) -> Result<HashMap<String, bool>, SyncError> {
        let device_capabilities = {
            let devices = self.inner.devices.read().await;
            devices
                .get(device_id)
                .ok_or_else(|| SyncError::DeviceNotFound {
                    device_id: device_id.to_string(),
                })?
                .capabilities
                .clone()
        };

        let status: HashMap<String, bool> = requested
            .iter()
            .map(|capability| {
                let supported = SUPPORTED_CAPABILITIES.contains(&capability.as_str())
                    && device_capabilities.contains(capability);
                (capability.clone(), supported)
            })
            .collect();

        let message = WireMessage::CapabilityNegotiation {
            requested_capabilities: requested.to_vec(),
            supported_capabilities: SUPPORTED_CAPABILITIES
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
            timestamp: unix_now(),
            message_id: new_message_id(),
        };
        self.send_message(device_id, message).await?;

        Ok(status)
    }

    /// IDs of every connected device
    pub async fn connected_devices(&self) -> Vec<String> {
        self.inner.devices.read().await.keys().cloned().collect()
    }

    /// Handshake identity of a connected device
    pub async fn device_info(&self, device_id: &str) -> Option<DeviceInfo> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .map(|handle| handle.info.clone())
    }

    /// Traffic statistics for a connected device
    pub async fn device_statistics(&self, device_id: &str) -> Option<ConnectionStats> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .map(|handle| handle.stats.clone())
    }

    /// Aggregate traffic statistics across all devices
    pub async fn network_statistics(&self) -> NetworkStatistics {
        let devices = self.inner.devices.read().await;

        let mut total_messages = 0;
        let mut total_bytes = 0;
        let mut latency_sum = 0.0;
        let mut latency_count = 0;
        for handle in devices.values() {
            total_messages += handle.stats.messages_sent + handle.stats.messages_received;
            total_bytes += handle.stats.bytes_sent + handle.stats.bytes_received;
            if handle.stats.latency_sample_count() > 0 {
                latency_sum += handle.stats.average_latency_ms;
                latency_count += 1;
            }
        }

        let average_latency_ms = if latency_count > 0 {
            latency_sum / f64::from(latency_count)
        } else {
            0.0
        };
        let quality = if devices.is_empty() {
            NetworkQuality::Unknown
        } else {
            NetworkQuality::from_latency_ms(average_latency_ms)
        };

        NetworkStatistics {
            active_devices: devices.len(),
            total_messages,
            total_bytes,
            average_latency_ms,
            quality,
        }
    }

    /// Commands currently awaiting acknowledgment
    pub async fn pending_acknowledgments(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

/// Accepts device connections and exchanges typed JSON messages over one
/// long-lived connection per device
pub struct DeviceCommandServer {
    inner: Arc<ServerInner>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    local_port: Option<u16>,
}

impl DeviceCommandServer {
    /// Create a stopped server with the given configuration
    #[must_use]
    pub fn new(config: CommandServerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let pending = PendingAcks::new(config.ack_timeout, config.max_ack_attempts);
        let limiter = RateLimiter::new(config.max_requests_per_minute, Duration::from_secs(60));

        Self {
            inner: Arc::new(ServerInner {
                config,
                devices: RwLock::new(HashMap::new()),
                pending: Mutex::new(pending),
                limiter: Mutex::new(limiter),
                event_tx,
                device_counter: AtomicU64::new(0),
            }),
            shutdown_tx: None,
            tasks: Vec::new(),
            local_port: None,
        }
    }

    /// Handle for sending commands and querying devices
    #[must_use]
    pub fn handle(&self) -> CommandHandle {
        CommandHandle {
            inner: self.inner.clone(),
        }
    }

    /// Subscribe to server events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Port the server is listening on, once started
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.local_port
    }

    /// Whether the server is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Start the accept loop and the retry/liveness sweeper
    ///
    /// # Errors
    /// Returns `SyncError::AlreadyRunning` if already started, or an IO
    /// error if the listen port cannot be bound.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.shutdown_tx.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let listener = TcpListener::bind(("0.0.0.0", self.inner.config.port)).await?;
        let local_port = listener.local_addr()?.port();
        self.local_port = Some(local_port);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let inner = self.inner.clone();
        let mut accept_shutdown = shutdown_rx.clone();
        let conn_shutdown = shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => {
                            if !inner.limiter.lock().await.check(addr.ip()) {
                                tracing::warn!("rate limited connection from {}", addr);
                                continue;
                            }
                            tracing::info!("new connection from {}", addr);
                            tokio::spawn(handle_connection(
                                inner.clone(),
                                stream,
                                addr,
                                conn_shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!("device server accept error: {}", e);
                        }
                    },
                    _ = accept_shutdown.changed() => break,
                }
            }
            tracing::info!("device server loop ended");
        }));

        let inner = self.inner.clone();
        let mut sweep_shutdown = shutdown_rx;
        self.tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => sweep(&inner).await,
                    _ = sweep_shutdown.changed() => break,
                }
            }
        }));

        tracing::info!("device command server started on port {}", local_port);
        Ok(())
    }

    /// Stop the server, dropping every device connection
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = shutdown_tx.send(true);

        // Dropping the handles closes each device's outbound queue, which
        // ends its writer task and closes the socket.
        self.inner.devices.write().await.clear();

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.local_port = None;
        tracing::info!("device command server stopped");
    }
}

/// One sweeper pass: drive pending-ack deadlines, then liveness
async fn sweep(inner: &Arc<ServerInner>) {
    let outcome = inner.pending.lock().await.sweep(Instant::now());

    for entry in outcome.retries {
        let outbound = inner
            .devices
            .read()
            .await
            .get(&entry.device_id)
            .map(|handle| handle.outbound.clone());

        let Some(outbound) = outbound else {
            inner.pending.lock().await.remove(&entry.message_id);
            continue;
        };

        tracing::warn!(
            "retrying command {} to {} (attempt {}/{})",
            entry.command.as_str(),
            entry.device_id,
            entry.attempts,
            entry.max_attempts
        );
        let message = WireMessage::Command {
            command: entry.command,
            parameters: entry.parameters.clone(),
            timestamp: unix_now(),
            message_id: entry.message_id.clone(),
            require_ack: true,
            retry_attempt: Some(entry.attempts),
        };
        if outbound.send(message).await.is_err() {
            inner.pending.lock().await.remove(&entry.message_id);
        }
    }

    for entry in outcome.exhausted {
        tracing::error!(
            "command {} to {} failed after {} attempts",
            entry.command.as_str(),
            entry.device_id,
            entry.attempts
        );
        let _ = inner.event_tx.send(ServerEvent::DeliveryFailed {
            device_id: entry.device_id,
            message_id: entry.message_id,
            command: entry.command,
            attempts: entry.attempts,
        });
    }

    let heartbeat_interval = inner.config.heartbeat_interval;
    let stale: Vec<String> = inner
        .devices
        .read()
        .await
        .iter()
        .filter(|(_, handle)| !handle.is_alive(heartbeat_interval))
        .map(|(device_id, _)| device_id.clone())
        .collect();
    for device_id in stale {
        tracing::warn!("device {} heartbeat timeout", device_id);
        inner.deregister(&device_id, "heartbeat timeout").await;
    }
}

/// Handle one device connection from handshake to teardown
async fn handle_connection(
    inner: Arc<ServerInner>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connection = framed(stream, inner.config.max_frame_bytes);

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, connection.next()).await;
    let payload = match first {
        Ok(Some(Ok(payload))) => payload,
        Ok(Some(Err(e))) => {
            tracing::warn!("handshake read from {} failed: {}", addr, e);
            return;
        }
        Ok(None) => return,
        Err(_) => {
            tracing::warn!("handshake from {} timed out", addr);
            return;
        }
    };

    let (info, capabilities) = match decode_message(&payload) {
        Ok(WireMessage::Handshake {
            device_info,
            capabilities,
            ..
        }) => (device_info, capabilities),
        Ok(other) => {
            tracing::warn!("expected handshake from {}, got {}", addr, other.kind());
            reject(&mut connection, "expected handshake").await;
            return;
        }
        Err(e) => {
            tracing::warn!("invalid handshake from {}: {}", addr, e);
            reject(&mut connection, "invalid handshake").await;
            return;
        }
    };

    let seq = inner.device_counter.fetch_add(1, Ordering::Relaxed) + 1;
    let device_id = format!("{}-{}", info.device_type.label(), seq);

    let reply = HandshakeReply::accepted(&device_id, unix_now());
    let Ok(reply_bytes) = serde_json::to_vec(&reply) else {
        return;
    };
    if connection.send(Bytes::from(reply_bytes)).await.is_err() {
        return;
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    {
        let mut devices = inner.devices.write().await;
        devices.insert(
            device_id.clone(),
            DeviceHandle {
                device_id: device_id.clone(),
                info: info.clone(),
                capabilities: capabilities.clone(),
                addr,
                outbound: outbound_tx,
                last_seen: Instant::now(),
                stats: ConnectionStats::default(),
            },
        );
    }
    tracing::info!(
        "device registered: {} ({}) from {}",
        device_id,
        info.name,
        addr
    );
    let _ = inner.event_tx.send(ServerEvent::DeviceConnected {
        device_id: device_id.clone(),
        info,
        capabilities,
    });

    let (sink, mut frames) = connection.split();
    let writer = tokio::spawn(writer_loop(device_id.clone(), sink, outbound_rx, inner.clone()));

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(payload)) => {
                    let size = payload.len();
                    match decode_message(&payload) {
                        Ok(message) => {
                            if !inner.ingest(&device_id, message, size).await {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("unparseable message from {}: {}", device_id, e);
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("receive error for {}: {}", device_id, e);
                    break;
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    inner.deregister(&device_id, "connection closed").await;
    let _ = writer.await;
}

/// Send a rejecting handshake reply, ignoring failures
async fn reject(connection: &mut Framed<TcpStream, LengthDelimitedCodec>, reason: &str) {
    let reply = HandshakeReply::rejected(reason, unix_now());
    if let Ok(bytes) = serde_json::to_vec(&reply) {
        let _ = connection.send(Bytes::from(bytes)).await;
    }
}

/// Drain a device's outbound queue onto its socket
async fn writer_loop(
    device_id: String,
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<WireMessage>,
    inner: Arc<ServerInner>,
) {
    while let Some(message) = outbound.recv().await {
        let bytes = match encode_message(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("failed to encode {} for {}: {}", message.kind(), device_id, e);
                continue;
            }
        };
        let size = bytes.len();

        if let Err(e) = sink.send(bytes).await {
            tracing::warn!("send to {} failed: {}", device_id, e);
            inner.deregister(&device_id, "send failure").await;
            break;
        }

        if let Some(handle) = inner.devices.write().await.get_mut(&device_id) {
            handle.stats.record_sent(size);
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests;
