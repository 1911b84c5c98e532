use std::io;
use thiserror::Error;

/// Errors that can occur during synchronization and device coordination
#[derive(Debug, Error)]
pub enum SyncError {
    // ===== Lifecycle Errors =====
    /// Service already running
    #[error("service already running")]
    AlreadyRunning,

    /// Service not running
    #[error("service not running")]
    NotRunning,

    // ===== Device Errors =====
    /// Device is not connected
    #[error("device not connected: {device_id}")]
    DeviceNotFound {
        /// The ID of the device that was not found
        device_id: String,
    },

    /// Device connection was lost while sending
    #[error("device disconnected: {device_id}")]
    Disconnected {
        /// The ID of the disconnected device
        device_id: String,
    },

    /// Source exceeded the connection/request rate limit
    #[error("rate limit exceeded for {addr}")]
    RateLimited {
        /// The rate-limited source address
        addr: String,
    },

    /// Handshake was rejected
    #[error("handshake rejected: {reason}")]
    HandshakeRejected {
        /// Why the handshake was rejected
        reason: String,
    },

    /// Command was never acknowledged after all retry attempts
    #[error("command {command} to {device_id} failed after {attempts} attempts")]
    DeliveryFailed {
        /// The target device
        device_id: String,
        /// The command that failed
        command: String,
        /// Number of send attempts made
        attempts: u32,
    },

    // ===== Session Errors =====
    /// A session with this ID already exists
    #[error("session already active: {session_id}")]
    SessionAlreadyActive {
        /// The conflicting session ID
        session_id: String,
    },

    /// No session with this ID exists
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The unknown session ID
        session_id: String,
    },

    /// Recording was requested with no devices to record on
    #[error("no target devices available for recording")]
    NoTargetDevices,

    // ===== Protocol Errors =====
    /// Wire message encoding/decoding failed
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Protocol violation (unexpected message, oversized frame, ...)
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation
        message: String,
    },

    // ===== Upstream Errors =====
    /// An upstream NTP query failed
    #[error("upstream time query failed for {host}: {message}")]
    UpstreamQuery {
        /// The queried host
        host: String,
        /// Description of the failure
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    /// Check whether the error is transient and the operation may be retried
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. }
                | SyncError::UpstreamQuery { .. }
                | SyncError::Disconnected { .. }
                | SyncError::Io(_)
        )
    }
}
