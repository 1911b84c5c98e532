use std::collections::HashSet;

use serde::Serialize;

/// A bounded recording activity spanning one or more devices
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSession {
    /// Caller-supplied session identifier
    pub session_id: String,

    /// Master clock time (unix seconds) stamped at session start
    pub start_timestamp: f64,

    /// Member device IDs; shrinks when a member disconnects
    pub devices: HashSet<String>,

    /// Whether the session is still recording
    pub is_active: bool,

    /// Session-level quality: mean of member sync qualities
    pub sync_quality: f64,
}

impl RecordingSession {
    /// Create a new active session
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        start_timestamp: f64,
        devices: HashSet<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            start_timestamp,
            devices,
            is_active: true,
            sync_quality: 1.0,
        }
    }

    /// Elapsed duration against the given master timestamp
    #[must_use]
    pub fn duration_secs(&self, now: f64) -> f64 {
        (now - self.start_timestamp).max(0.0)
    }
}
