//! Time-reference service
//!
//! Maintains a drift-corrected notion of "now" by querying upstream NTP
//! hosts and taking the median offset, and serves that corrected time to
//! remote devices over a stateless JSON request/response protocol.

pub mod ntp;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::protocol::{unix_now, WireMessage};
use crate::types::{ReferenceSource, TimeServerStatus, TimeServiceConfig};

/// Clients unseen for this long no longer count as connected
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Precision reported while running on the raw system clock
const FALLBACK_PRECISION_MS: f64 = 10.0;

/// Emitted for every served time-sync request
#[derive(Debug, Clone)]
pub struct TimeSyncEvent {
    /// Requesting client ID
    pub client_id: String,
    /// Request sequence number
    pub sequence: u64,
    /// Server precision sent with the response
    pub precision_ms: f64,
}

/// Corrected-clock state shared between the sync loop and readers
#[derive(Debug)]
struct ClockState {
    offset_secs: f64,
    precision_ms: f64,
    synchronized: bool,
    source: ReferenceSource,
    last_ntp_sync: Option<f64>,
}

impl ClockState {
    fn new() -> Self {
        Self {
            offset_secs: 0.0,
            precision_ms: 1.0,
            synchronized: false,
            source: ReferenceSource::System,
            last_ntp_sync: None,
        }
    }
}

/// Cheap, cloneable handle to the corrected clock
///
/// The offset is read, never recomputed, on each call, so `now()` is safe
/// to use from any number of request-handling tasks.
#[derive(Debug, Clone)]
pub struct Clock {
    state: Arc<RwLock<ClockState>>,
}

impl Clock {
    fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ClockState::new())),
        }
    }

    /// Corrected unix time in seconds
    pub async fn now(&self) -> f64 {
        let state = self.state.read().await;
        if state.synchronized {
            unix_now() + state.offset_secs
        } else {
            unix_now()
        }
    }

    /// Corrected unix time in integer milliseconds
    pub async fn now_millis(&self) -> i64 {
        (self.now().await * 1000.0) as i64
    }

    /// Current precision estimate in milliseconds
    pub async fn precision_ms(&self) -> f64 {
        self.state.read().await.precision_ms
    }

    /// Whether an upstream sync has succeeded
    pub async fn is_synchronized(&self) -> bool {
        self.state.read().await.synchronized
    }
}

/// Rolling request-serving statistics
#[derive(Debug)]
struct ServeStats {
    requests_served: u64,
    response_times: VecDeque<f64>,
    clients: HashMap<String, Instant>,
}

impl ServeStats {
    fn new() -> Self {
        Self {
            requests_served: 0,
            response_times: VecDeque::new(),
            clients: HashMap::new(),
        }
    }

    fn record(&mut self, client_id: &str, response_time_ms: f64, max_history: usize) {
        self.requests_served += 1;
        self.clients.insert(client_id.to_string(), Instant::now());
        self.response_times.push_back(response_time_ms);
        while self.response_times.len() > max_history {
            self.response_times.pop_front();
        }
    }

    fn prune_clients(&mut self, idle_timeout: Duration) {
        self.clients
            .retain(|_, last_seen| last_seen.elapsed() < idle_timeout);
    }

    fn average_response_time_ms(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        self.response_times.iter().sum::<f64>() / self.response_times.len() as f64
    }
}

/// Local time-reference service: upstream NTP correction plus a TCP
/// request/response endpoint for devices
pub struct TimeReferenceService {
    config: TimeServiceConfig,
    clock: Clock,
    stats: Arc<RwLock<ServeStats>>,
    event_tx: broadcast::Sender<TimeSyncEvent>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    local_port: Option<u16>,
}

impl TimeReferenceService {
    /// Create a stopped service with the given configuration
    #[must_use]
    pub fn new(config: TimeServiceConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            config,
            clock: Clock::new(),
            stats: Arc::new(RwLock::new(ServeStats::new())),
            event_tx,
            shutdown_tx: None,
            tasks: Vec::new(),
            local_port: None,
        }
    }

    /// Handle to the corrected clock
    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    /// Corrected unix time in seconds
    pub async fn now(&self) -> f64 {
        self.clock.now().await
    }

    /// Subscribe to served-request events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimeSyncEvent> {
        self.event_tx.subscribe()
    }

    /// Port the service is listening on, once started
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.local_port
    }

    /// Whether the service is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Query the upstream hosts once and update the corrected clock
    ///
    /// Returns true if at least one upstream query succeeded.
    pub async fn synchronize_with_upstream(&self) -> bool {
        synchronize_upstream(&self.config, &self.clock).await
    }

    /// Start the accept loop and the periodic upstream-sync loop
    ///
    /// # Errors
    /// Returns `SyncError::AlreadyRunning` if already started, or an IO
    /// error if the listen port cannot be bound.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.shutdown_tx.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let local_port = listener.local_addr()?.port();
        self.local_port = Some(local_port);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        // Upstream sync loop: once at startup, then on the configured interval.
        let config = self.config.clone();
        let clock = self.clock.clone();
        let mut sync_shutdown = shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                synchronize_upstream(&config, &clock).await;
                tokio::select! {
                    () = tokio::time::sleep(config.ntp_sync_interval) => {}
                    _ = sync_shutdown.changed() => break,
                }
            }
        }));

        let config = self.config.clone();
        let clock = self.clock.clone();
        let stats = self.stats.clone();
        let event_tx = self.event_tx.clone();
        let mut accept_shutdown = shutdown_rx;
        self.tasks.push(tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));

            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => {
                            let semaphore = semaphore.clone();
                            let clock = clock.clone();
                            let stats = stats.clone();
                            let event_tx = event_tx.clone();
                            let max_history = config.max_response_history;

                            tokio::spawn(async move {
                                let Ok(_permit) = semaphore.acquire_owned().await else {
                                    return;
                                };
                                if let Err(e) = serve_sync_request(
                                    stream, &clock, &stats, &event_tx, max_history,
                                )
                                .await
                                {
                                    tracing::debug!("sync request from {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("time server accept error: {}", e);
                        }
                    },
                    _ = accept_shutdown.changed() => break,
                }
            }

            tracing::info!("time server loop ended");
        }));

        tracing::info!("time reference service started on port {}", local_port);
        Ok(())
    }

    /// Stop both loops and wait for them to exit
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = shutdown_tx.send(true);

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.local_port = None;
        self.stats.write().await.clients.clear();
        tracing::info!("time reference service stopped");
    }

    /// Snapshot of the service state, pruning idle clients first
    pub async fn status(&self) -> TimeServerStatus {
        let mut stats = self.stats.write().await;
        stats.prune_clients(CLIENT_IDLE_TIMEOUT);

        let clock = self.clock.state.read().await;
        TimeServerStatus {
            is_running: self.is_running(),
            is_synchronized: clock.synchronized,
            reference_source: clock.source,
            last_ntp_sync: clock.last_ntp_sync,
            time_accuracy_ms: clock.precision_ms,
            client_count: stats.clients.len(),
            requests_served: stats.requests_served,
            average_response_time_ms: stats.average_response_time_ms(),
        }
    }
}

/// One upstream sync cycle: query every host, apply the median offset
async fn synchronize_upstream(config: &TimeServiceConfig, clock: &Clock) -> bool {
    tracing::debug!("synchronizing with {} upstream hosts", config.ntp_hosts.len());

    let mut offsets = Vec::new();
    let mut delays = Vec::new();
    for host in &config.ntp_hosts {
        match ntp::query_host(host, config.query_timeout).await {
            Ok(sample) => {
                tracing::debug!(
                    "upstream {}: offset={:.3}ms delay={:.3}ms",
                    host,
                    sample.offset * 1000.0,
                    sample.delay * 1000.0
                );
                offsets.push(sample.offset);
                delays.push(sample.delay);
            }
            Err(e) => {
                tracing::warn!("upstream sync with {} failed: {}", host, e);
            }
        }
    }

    let mut state = clock.state.write().await;
    if offsets.is_empty() {
        tracing::error!("all upstream sync attempts failed, using system clock");
        state.synchronized = false;
        state.source = ReferenceSource::System;
        state.precision_ms = FALLBACK_PRECISION_MS;
        return false;
    }

    state.offset_secs = median(offsets);
    state.precision_ms = median(delays) * 1000.0 / 2.0;
    state.synchronized = true;
    state.source = ReferenceSource::Ntp;
    state.last_ntp_sync = Some(unix_now());

    tracing::info!(
        "upstream sync successful: offset={:.3}ms precision={:.3}ms",
        state.offset_secs * 1000.0,
        state.precision_ms
    );
    true
}

/// Median of a non-empty sample set (mean of the two middles when even)
fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Serve one stateless time-sync request and close the connection
async fn serve_sync_request(
    mut stream: TcpStream,
    clock: &Clock,
    stats: &Arc<RwLock<ServeStats>>,
    event_tx: &broadcast::Sender<TimeSyncEvent>,
    max_history: usize,
) -> Result<(), SyncError> {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let receive_timestamp = clock.now().await;

    let message: WireMessage = match serde_json::from_slice(&buf[..n]) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("dropping malformed sync request: {}", e);
            return Ok(());
        }
    };

    let WireMessage::TimeSyncRequest {
        client_id,
        timestamp: request_timestamp,
        sequence,
    } = message
    else {
        tracing::debug!("dropping {} on time-sync port", message.kind());
        return Ok(());
    };

    let precision_ms = clock.precision_ms().await;
    let response_timestamp = clock.now().await;
    let response = WireMessage::TimeSyncResponse {
        server_timestamp: response_timestamp,
        request_timestamp,
        receive_timestamp,
        response_timestamp,
        server_precision_ms: precision_ms,
        sequence,
        server_time_ms: (response_timestamp * 1000.0) as i64,
    };

    stats.write().await.record(
        &client_id,
        (response_timestamp - receive_timestamp) * 1000.0,
        max_history,
    );

    stream.write_all(&serde_json::to_vec(&response)?).await?;

    let _ = event_tx.send(TimeSyncEvent {
        client_id: client_id.clone(),
        sequence,
        precision_ms,
    });

    tracing::debug!("served time sync request from {} (seq={})", client_id, sequence);
    Ok(())
}

#[cfg(test)]
mod tests;
