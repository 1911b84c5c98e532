//! Server events for coordinator and application integration

use crate::protocol::{CommandKind, WireMessage};
use crate::types::DeviceInfo;

/// Events emitted by the device-command server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A device completed its handshake and was registered
    DeviceConnected {
        /// Assigned device ID
        device_id: String,
        /// Identity from the handshake
        info: DeviceInfo,
        /// Declared capabilities
        capabilities: Vec<String>,
    },

    /// A device was deregistered
    DeviceDisconnected {
        /// The removed device
        device_id: String,
        /// Why it was removed
        reason: String,
    },

    /// A message arrived from a device (status, frame, telemetry, ...)
    Message {
        /// Sending device
        device_id: String,
        /// The decoded message
        message: WireMessage,
    },

    /// A pending command was acknowledged
    CommandAcknowledged {
        /// Acknowledging device
        device_id: String,
        /// ID of the acknowledged command
        message_id: String,
        /// Observed round-trip latency
        latency_ms: f64,
    },

    /// A command was never acknowledged after all attempts
    DeliveryFailed {
        /// Target device
        device_id: String,
        /// ID of the failed command
        message_id: String,
        /// The command that failed
        command: CommandKind,
        /// Sends made before giving up
        attempts: u32,
    },
}
