use std::time::Duration;

/// Configuration for the time-reference service
#[derive(Debug, Clone)]
pub struct TimeServiceConfig {
    /// TCP port for time-sync requests (0 = auto-assign)
    pub port: u16,

    /// Upstream NTP hosts, queried in order each sync cycle
    pub ntp_hosts: Vec<String>,

    /// Interval between upstream re-sync cycles
    pub ntp_sync_interval: Duration,

    /// Per-host query timeout
    pub query_timeout: Duration,

    /// Maximum concurrently handled sync requests
    pub max_concurrent_requests: usize,

    /// Response-time samples kept for the rolling average
    pub max_response_history: usize,
}

impl Default for TimeServiceConfig {
    fn default() -> Self {
        Self {
            port: 8889,
            ntp_hosts: vec![
                "pool.ntp.org".to_string(),
                "time.google.com".to_string(),
                "time.cloudflare.com".to_string(),
            ],
            ntp_sync_interval: Duration::from_secs(300),
            query_timeout: Duration::from_secs(5),
            max_concurrent_requests: 10,
            max_response_history: 100,
        }
    }
}

/// Configuration for the device-command server
#[derive(Debug, Clone)]
pub struct CommandServerConfig {
    /// TCP listen port for device connections (0 = auto-assign)
    pub port: u16,

    /// Expected heartbeat interval; a device silent for twice this long
    /// is treated as disconnected
    pub heartbeat_interval: Duration,

    /// Time to wait for a command acknowledgment before retrying
    pub ack_timeout: Duration,

    /// Total send attempts for an acknowledged command
    pub max_ack_attempts: u32,

    /// Per-source-IP connection/request budget within a sliding 60 s window
    pub max_requests_per_minute: usize,

    /// Maximum wire frame size in bytes
    pub max_frame_bytes: usize,

    /// Tick interval of the retry/liveness sweeper
    pub sweep_interval: Duration,
}

impl Default for CommandServerConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            heartbeat_interval: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            max_ack_attempts: 3,
            max_requests_per_minute: 60,
            max_frame_bytes: 1024 * 1024,
            sweep_interval: Duration::from_millis(250),
        }
    }
}

/// Configuration for the clock coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time-reference service settings
    pub time_service: TimeServiceConfig,

    /// Device-command server settings
    pub command_server: CommandServerConfig,

    /// Monitoring-loop interval; devices unseen for twice this long are
    /// re-probed
    pub sync_interval: Duration,

    /// Largest acceptable clock offset in milliseconds
    pub sync_tolerance_ms: f64,

    /// Quality below which a device is flagged when a recording starts
    pub quality_threshold: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            time_service: TimeServiceConfig::default(),
            command_server: CommandServerConfig::default(),
            sync_interval: Duration::from_secs(5),
            sync_tolerance_ms: 50.0,
            quality_threshold: 0.8,
        }
    }
}

impl CoordinatorConfig {
    /// Set the time-sync and device-command ports
    #[must_use]
    pub fn ports(mut self, time_port: u16, command_port: u16) -> Self {
        self.time_service.port = time_port;
        self.command_server.port = command_port;
        self
    }

    /// Set the monitoring interval
    #[must_use]
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the sync tolerance in milliseconds
    #[must_use]
    pub fn sync_tolerance_ms(mut self, tolerance: f64) -> Self {
        self.sync_tolerance_ms = tolerance;
        self
    }
}
