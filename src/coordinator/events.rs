//! Coordinator events for GUI and dashboard integration

use std::collections::HashMap;

use crate::types::{RecordingSession, SyncStatus};

/// Events emitted by the clock coordinator
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Recording started; webcam-type devices align to this instant
    WebcamSync {
        /// Master clock time the recording is anchored to
        master_timestamp: f64,
    },

    /// A recording session was created
    SessionStarted {
        /// The new session
        session: RecordingSession,
    },

    /// A recording session was stopped
    SessionStopped {
        /// The stopped session
        session_id: String,
        /// Recorded duration in seconds
        duration_secs: f64,
    },

    /// Periodic snapshot of every device's sync state
    SyncSnapshot {
        /// Device table keyed by device ID
        devices: HashMap<String, SyncStatus>,
    },
}
