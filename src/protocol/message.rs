use serde::{Deserialize, Serialize};

use crate::types::DeviceInfo;

/// Recording command carried in a [`WireMessage::Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Start recording the session named in the parameters
    StartRecord,
    /// Stop the current recording
    StopRecord,
}

impl CommandKind {
    /// Wire name of the command
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::StartRecord => "start_record",
            CommandKind::StopRecord => "stop_record",
        }
    }
}

/// Parameters attached to a recording command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandParameters {
    /// Session the command belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Record RGB video
    #[serde(default)]
    pub record_video: bool,

    /// Record thermal frames
    #[serde(default)]
    pub record_thermal: bool,

    /// Record GSR samples
    #[serde(default)]
    pub record_shimmer: bool,
}

impl CommandParameters {
    /// Parameters for a session start with the given modality flags
    #[must_use]
    pub fn for_session(
        session_id: impl Into<String>,
        record_video: bool,
        record_thermal: bool,
        record_shimmer: bool,
    ) -> Self {
        Self {
            session_id: Some(session_id.into()),
            record_video,
            record_thermal,
            record_shimmer,
        }
    }
}

/// All messages exchanged on the wire, tagged by their JSON `type` field
///
/// Unknown `type` values fail decoding and are logged and dropped by the
/// transport layer; they never reach dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// First message on a device connection
    Handshake {
        /// Declared device identity
        device_info: DeviceInfo,
        /// Capabilities the device offers
        #[serde(default)]
        capabilities: Vec<String>,
        /// Device clock at send time (unix seconds)
        timestamp: f64,
    },

    /// Stateless time-sync request (one per connection)
    TimeSyncRequest {
        /// Caller-chosen client identifier
        client_id: String,
        /// Client clock at send time
        timestamp: f64,
        /// Correlation sequence number
        #[serde(default)]
        sequence: u64,
    },

    /// Reply to a [`WireMessage::TimeSyncRequest`]
    TimeSyncResponse {
        /// Server clock when the response was built
        server_timestamp: f64,
        /// Echo of the request timestamp
        request_timestamp: f64,
        /// Server clock when the request arrived
        receive_timestamp: f64,
        /// Server clock when the response was sent
        response_timestamp: f64,
        /// Server clock precision in milliseconds
        server_precision_ms: f64,
        /// Echo of the request sequence
        sequence: u64,
        /// Server clock in integer milliseconds
        server_time_ms: i64,
    },

    /// Coordinator sync probe; the device answers with any timestamped
    /// message
    SyncTimestamp {
        /// Master clock at send time
        timestamp: f64,
    },

    /// Recording command
    Command {
        /// What to do
        command: CommandKind,
        /// Command parameters
        #[serde(default)]
        parameters: CommandParameters,
        /// Master clock at send time
        timestamp: f64,
        /// Correlation ID for acknowledgment
        message_id: String,
        /// Whether the sender expects an acknowledgment
        #[serde(default)]
        require_ack: bool,
        /// Present on retries, counting from 2
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_attempt: Option<u32>,
    },

    /// Confirms receipt of a command
    Acknowledgment {
        /// ID of the acknowledged command
        message_id: String,
        /// Whether the device accepted the command
        #[serde(default = "default_true")]
        success: bool,
        /// Device clock at send time
        timestamp: f64,
    },

    /// Keep-alive; refreshes liveness only
    Heartbeat {
        /// Device clock at send time
        timestamp: f64,
    },

    /// Periodic device status report
    Status {
        /// Battery percentage, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        battery: Option<i32>,
        /// Free storage description, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        storage: Option<String>,
        /// Device temperature in °C, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f64>,
        /// Whether the device is recording
        #[serde(default)]
        recording: bool,
        /// Frames captured so far, if reported
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame_count: Option<u64>,
        /// Device clock at send time
        timestamp: f64,
    },

    /// Preview frame pushed by a device
    Frame {
        /// Frame kind ("rgb", "thermal", ...)
        frame_type: String,
        /// Base64-encoded frame payload
        data: String,
        /// Device clock at capture time
        timestamp: f64,
    },

    /// Server-initiated capability negotiation
    CapabilityNegotiation {
        /// Capabilities the server asks about
        requested_capabilities: Vec<String>,
        /// Capabilities the server supports
        supported_capabilities: Vec<String>,
        /// Master clock at send time
        timestamp: f64,
        /// Correlation ID
        message_id: String,
    },

    /// Device answer to a capability negotiation
    CapabilityResponse {
        /// Capabilities the device confirms
        capabilities: Vec<String>,
        /// Device clock at send time
        timestamp: f64,
    },

    /// Device-side error report
    Error {
        /// Error description
        error: String,
        /// Device clock at send time
        timestamp: f64,
    },

    /// Orderly disconnect notice
    Disconnect {
        /// Why the peer is leaving
        reason: String,
        /// Peer clock at send time
        timestamp: f64,
    },
}

fn default_true() -> bool {
    true
}

impl WireMessage {
    /// The sender's clock at send time, carried by every message
    #[must_use]
    pub fn timestamp(&self) -> f64 {
        match self {
            WireMessage::Handshake { timestamp, .. }
            | WireMessage::TimeSyncRequest { timestamp, .. }
            | WireMessage::SyncTimestamp { timestamp }
            | WireMessage::Command { timestamp, .. }
            | WireMessage::Acknowledgment { timestamp, .. }
            | WireMessage::Heartbeat { timestamp }
            | WireMessage::Status { timestamp, .. }
            | WireMessage::Frame { timestamp, .. }
            | WireMessage::CapabilityNegotiation { timestamp, .. }
            | WireMessage::CapabilityResponse { timestamp, .. }
            | WireMessage::Error { timestamp, .. }
            | WireMessage::Disconnect { timestamp, .. } => *timestamp,
            WireMessage::TimeSyncResponse {
                server_timestamp, ..
            } => *server_timestamp,
        }
    }

    /// Wire name of the message kind, for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Handshake { .. } => "handshake",
            WireMessage::TimeSyncRequest { .. } => "time_sync_request",
            WireMessage::TimeSyncResponse { .. } => "time_sync_response",
            WireMessage::SyncTimestamp { .. } => "sync_timestamp",
            WireMessage::Command { .. } => "command",
            WireMessage::Acknowledgment { .. } => "acknowledgment",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::Status { .. } => "status",
            WireMessage::Frame { .. } => "frame",
            WireMessage::CapabilityNegotiation { .. } => "capability_negotiation",
            WireMessage::CapabilityResponse { .. } => "capability_response",
            WireMessage::Error { .. } => "error",
            WireMessage::Disconnect { .. } => "disconnect",
        }
    }
}

/// Outcome of a handshake, sent untagged as the first server frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeStatus {
    /// Device admitted
    Accepted,
    /// Device refused
    Rejected,
}

/// Server identity sent with an accepted handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server role
    #[serde(rename = "type")]
    pub kind: String,
    /// Server version
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            kind: "recording_controller".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Reply to a device handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Accepted or rejected
    pub status: HandshakeStatus,

    /// Server identity (accepted only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,

    /// Assigned device ID (accepted only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Rejection reason (rejected only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Server clock at send time
    pub timestamp: f64,
}

impl HandshakeReply {
    /// Accepting reply carrying the assigned device ID
    #[must_use]
    pub fn accepted(device_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            status: HandshakeStatus::Accepted,
            server_info: Some(ServerInfo::default()),
            device_id: Some(device_id.into()),
            error: None,
            timestamp,
        }
    }

    /// Rejecting reply with a reason
    #[must_use]
    pub fn rejected(error: impl Into<String>, timestamp: f64) -> Self {
        Self {
            status: HandshakeStatus::Rejected,
            server_info: None,
            device_id: None,
            error: Some(error.into()),
            timestamp,
        }
    }
}
