use serde::Serialize;

/// Where the reference clock currently comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    /// Corrected against upstream NTP servers
    Ntp,
    /// Raw system clock (upstream unreachable)
    System,
}

/// Snapshot of the time-reference service state
#[derive(Debug, Clone, Serialize)]
pub struct TimeServerStatus {
    /// Whether the service is accepting requests
    pub is_running: bool,

    /// Whether at least one upstream sync has succeeded
    pub is_synchronized: bool,

    /// Current reference source
    pub reference_source: ReferenceSource,

    /// Unix timestamp of the last successful upstream sync
    pub last_ntp_sync: Option<f64>,

    /// Estimated accuracy: half the median upstream round-trip delay
    pub time_accuracy_ms: f64,

    /// Clients seen within the last 60 seconds
    pub client_count: usize,

    /// Total sync requests served
    pub requests_served: u64,

    /// Mean response time over the recent request window
    pub average_response_time_ms: f64,
}
