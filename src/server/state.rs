//! Per-device connection state, traffic statistics and rate limiting

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::WireMessage;
use crate::types::DeviceInfo;

/// Latency samples kept per device
const LATENCY_WINDOW: usize = 100;

/// Traffic and latency statistics for one device connection
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    /// Messages sent to the device
    pub messages_sent: u64,
    /// Messages received from the device
    pub messages_received: u64,
    /// Bytes sent to the device
    pub bytes_sent: u64,
    /// Bytes received from the device
    pub bytes_received: u64,
    /// Errors observed on this connection
    pub error_count: u64,
    /// Recent latency samples in milliseconds
    #[serde(skip)]
    latency_samples: VecDeque<f64>,
    /// Mean of the latency window
    pub average_latency_ms: f64,
    /// Smallest observed latency
    pub min_latency_ms: f64,
    /// Largest observed latency
    pub max_latency_ms: f64,
    /// Standard deviation of the latency window
    pub jitter_ms: f64,
}

impl ConnectionStats {
    /// Record a sent message of the given encoded size
    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a received message of the given encoded size
    pub fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Record an observed round-trip latency and refresh the aggregates
    pub fn record_latency(&mut self, latency_ms: f64) {
        self.latency_samples.push_back(latency_ms);
        while self.latency_samples.len() > LATENCY_WINDOW {
            self.latency_samples.pop_front();
        }

        let len = self.latency_samples.len() as f64;
        self.average_latency_ms = self.latency_samples.iter().sum::<f64>() / len;
        self.min_latency_ms = self
            .latency_samples
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        self.max_latency_ms = self
            .latency_samples
            .iter()
            .copied()
            .fold(0.0_f64, f64::max);

        if self.latency_samples.len() >= 2 {
            let variance = self
                .latency_samples
                .iter()
                .map(|x| (x - self.average_latency_ms).powi(2))
                .sum::<f64>()
                / len;
            self.jitter_ms = variance.sqrt();
        }
    }

    /// Number of latency samples in the window
    #[must_use]
    pub fn latency_sample_count(&self) -> usize {
        self.latency_samples.len()
    }
}

/// Overall connection quality derived from average latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    /// Average latency below 50 ms
    Excellent,
    /// Average latency below 100 ms
    Good,
    /// Average latency below 200 ms
    Fair,
    /// Average latency of 200 ms or more
    Poor,
    /// No devices connected
    Unknown,
}

impl NetworkQuality {
    /// Classify an average latency
    #[must_use]
    pub fn from_latency_ms(average_latency_ms: f64) -> Self {
        if average_latency_ms < 50.0 {
            NetworkQuality::Excellent
        } else if average_latency_ms < 100.0 {
            NetworkQuality::Good
        } else if average_latency_ms < 200.0 {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }
}

/// Aggregate traffic statistics across all connected devices
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatistics {
    /// Currently connected devices
    pub active_devices: usize,
    /// Messages exchanged across all devices
    pub total_messages: u64,
    /// Bytes exchanged across all devices
    pub total_bytes: u64,
    /// Mean of the per-device average latencies
    pub average_latency_ms: f64,
    /// Overall quality label
    pub quality: NetworkQuality,
}

/// A registered device connection
#[derive(Debug)]
pub struct DeviceHandle {
    /// Assigned device ID
    pub device_id: String,
    /// Identity from the handshake
    pub info: DeviceInfo,
    /// Capabilities declared in the handshake
    pub capabilities: Vec<String>,
    /// Remote address
    pub addr: SocketAddr,
    /// Outbound message queue drained by the writer task
    pub outbound: mpsc::Sender<WireMessage>,
    /// Last time any message arrived from the device
    pub last_seen: Instant,
    /// Traffic statistics
    pub stats: ConnectionStats,
}

impl DeviceHandle {
    /// Whether the device has been heard from recently enough
    #[must_use]
    pub fn is_alive(&self, heartbeat_interval: Duration) -> bool {
        self.last_seen.elapsed() < heartbeat_interval * 2
    }
}

/// Per-source-IP sliding-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    requests: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_requests` per source per `window`
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            window,
            max_requests,
            requests: HashMap::new(),
        }
    }

    /// Record a request from `source` and report whether it is allowed
    pub fn check(&mut self, source: IpAddr) -> bool {
        let now = Instant::now();
        let requests = self.requests.entry(source).or_default();
        requests.retain(|at| now.duration_since(*at) < self.window);

        if requests.len() >= self.max_requests {
            return false;
        }
        requests.push(now);
        true
    }
}
