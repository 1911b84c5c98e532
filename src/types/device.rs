use serde::{Deserialize, Serialize};

/// Kind of measurement device in the rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// GSR sensor bridge (128 Hz galvanic skin response)
    Gsr,
    /// Thermal camera (25 Hz radiometric frames)
    Thermal,
    /// Android phone with RGB camera (30 fps video)
    AndroidRgb,
    /// Webcam attached to the controlling PC
    PcWebcam,
}

impl DeviceType {
    /// Short label used as the device-ID prefix
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            DeviceType::Gsr => "gsr",
            DeviceType::Thermal => "thermal",
            DeviceType::AndroidRgb => "android",
            DeviceType::PcWebcam => "webcam",
        }
    }

    /// Whether recording commands are delivered over the device-command
    /// channel (webcam devices start via the coordinator's sync tick instead)
    #[must_use]
    pub fn commands_over_network(self) -> bool {
        matches!(self, DeviceType::AndroidRgb)
    }
}

/// Identity a device declares in its handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name (e.g. "Pixel 7 left wrist")
    #[serde(default)]
    pub name: String,

    /// Kind of device
    pub device_type: DeviceType,

    /// Device model identifier, if declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl DeviceInfo {
    /// Create device info with just a type and name
    pub fn new(device_type: DeviceType, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_type,
            model: None,
        }
    }
}

/// Per-device synchronization state, owned by the coordinator
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    /// Unique device identifier
    pub device_id: String,

    /// Kind of device
    pub device_type: DeviceType,

    /// Whether the observed offset is within tolerance
    pub is_synchronized: bool,

    /// Observed clock offset in milliseconds (device clock minus master)
    pub time_offset_ms: f64,

    /// Unix timestamp of the last sync observation
    pub last_sync_time: f64,

    /// Sync quality score in [0, 1]
    pub sync_quality: f64,

    /// Whether the device reports an active recording
    pub recording_active: bool,

    /// Frames reported/streamed so far
    pub frame_count: u64,
}

impl SyncStatus {
    /// Fresh, unsynchronized status for a newly connected device
    #[must_use]
    pub fn new(device_id: impl Into<String>, device_type: DeviceType, now: f64) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            is_synchronized: false,
            time_offset_ms: 0.0,
            last_sync_time: now,
            sync_quality: 0.0,
            recording_active: false,
            frame_count: 0,
        }
    }
}
