use std::collections::HashSet;

use super::*;

#[test]
fn test_device_type_labels() {
    assert_eq!(DeviceType::Gsr.label(), "gsr");
    assert_eq!(DeviceType::Thermal.label(), "thermal");
    assert_eq!(DeviceType::AndroidRgb.label(), "android");
    assert_eq!(DeviceType::PcWebcam.label(), "webcam");
}

#[test]
fn test_device_type_wire_names() {
    let json = serde_json::to_string(&DeviceType::AndroidRgb).unwrap();
    assert_eq!(json, "\"android_rgb\"");

    let parsed: DeviceType = serde_json::from_str("\"pc_webcam\"").unwrap();
    assert_eq!(parsed, DeviceType::PcWebcam);
}

#[test]
fn test_only_android_commands_over_network() {
    assert!(DeviceType::AndroidRgb.commands_over_network());
    assert!(!DeviceType::Gsr.commands_over_network());
    assert!(!DeviceType::Thermal.commands_over_network());
    assert!(!DeviceType::PcWebcam.commands_over_network());
}

#[test]
fn test_fresh_sync_status_is_unsynchronized() {
    let status = SyncStatus::new("android-1", DeviceType::AndroidRgb, 1000.0);

    assert_eq!(status.device_id, "android-1");
    assert!(!status.is_synchronized);
    assert_eq!(status.sync_quality, 0.0);
    assert_eq!(status.time_offset_ms, 0.0);
    assert!(!status.recording_active);
    assert_eq!(status.frame_count, 0);
    assert_eq!(status.last_sync_time, 1000.0);
}

#[test]
fn test_session_duration() {
    let devices: HashSet<String> = ["d1".to_string()].into_iter().collect();
    let session = RecordingSession::new("s1", 100.0, devices);

    assert!(session.is_active);
    assert_eq!(session.duration_secs(160.5), 60.5);
    // Clock going backwards never yields a negative duration
    assert_eq!(session.duration_secs(90.0), 0.0);
}

#[test]
fn test_config_defaults() {
    let config = CoordinatorConfig::default();

    assert_eq!(config.time_service.port, 8889);
    assert_eq!(config.command_server.port, 9000);
    assert_eq!(config.sync_tolerance_ms, 50.0);
    assert_eq!(config.quality_threshold, 0.8);
    assert_eq!(config.command_server.max_ack_attempts, 3);
    assert_eq!(config.time_service.ntp_hosts.len(), 3);
}

#[test]
fn test_config_builders() {
    let config = CoordinatorConfig::default()
        .ports(0, 0)
        .sync_tolerance_ms(25.0);

    assert_eq!(config.time_service.port, 0);
    assert_eq!(config.command_server.port, 0);
    assert_eq!(config.sync_tolerance_ms, 25.0);
}
