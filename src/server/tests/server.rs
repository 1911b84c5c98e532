use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::SyncError;
use crate::protocol::{
    decode_message, encode_message, framed, unix_now, CommandKind, CommandParameters,
    HandshakeReply, HandshakeStatus, WireMessage,
};
use crate::server::{DeviceCommandServer, NetworkQuality, ServerEvent};
use crate::types::{CommandServerConfig, DeviceInfo, DeviceType};

type DeviceConn = Framed<TcpStream, LengthDelimitedCodec>;

/// Ephemeral port, fast sweeper, short ack timeout
fn quick_config() -> CommandServerConfig {
    CommandServerConfig {
        port: 0,
        heartbeat_interval: Duration::from_secs(5),
        ack_timeout: Duration::from_millis(150),
        max_ack_attempts: 3,
        sweep_interval: Duration::from_millis(25),
        ..CommandServerConfig::default()
    }
}

async fn started(config: CommandServerConfig) -> DeviceCommandServer {
    let mut server = DeviceCommandServer::new(config);
    server.start().await.unwrap();
    server
}

async fn connect_device(port: u16, device_type: DeviceType, name: &str) -> (DeviceConn, String) {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut conn = framed(stream, 1024 * 1024);

    let handshake = WireMessage::Handshake {
        device_info: DeviceInfo::new(device_type, name),
        capabilities: vec!["recording".to_string(), "streaming".to_string()],
        timestamp: unix_now(),
    };
    conn.send(encode_message(&handshake).unwrap()).await.unwrap();

    let frame = conn.next().await.unwrap().unwrap();
    let reply: HandshakeReply = serde_json::from_slice(&frame).unwrap();
    assert_eq!(reply.status, HandshakeStatus::Accepted);
    (conn, reply.device_id.unwrap())
}

async fn next_message(conn: &mut DeviceConn) -> WireMessage {
    let frame = tokio::time::timeout(Duration::from_secs(2), conn.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .expect("frame error");
    decode_message(&frame).unwrap()
}

async fn send_message(conn: &mut DeviceConn, message: &WireMessage) {
    conn.send(encode_message(message).unwrap()).await.unwrap();
}

/// Wait for the first event matching the predicate
async fn wait_for_event(
    events: &mut broadcast::Receiver<ServerEvent>,
    matches: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_handshake_assigns_monotonic_ids() {
    let mut server = started(quick_config()).await;
    let mut events = server.subscribe();
    let port = server.port().unwrap();

    let (_conn_a, id_a) = connect_device(port, DeviceType::AndroidRgb, "pixel").await;
    let (_conn_b, id_b) = connect_device(port, DeviceType::Thermal, "flir").await;

    assert_eq!(id_a, "android-1");
    assert_eq!(id_b, "thermal-2");

    wait_for_event(&mut events, |e| {
        matches!(e, ServerEvent::DeviceConnected { device_id, .. } if device_id == "thermal-2")
    })
    .await;

    let mut connected = server.handle().connected_devices().await;
    connected.sort();
    assert_eq!(connected, vec!["android-1", "thermal-2"]);

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_first_message_rejected() {
    let mut server = started(quick_config()).await;
    let port = server.port().unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut conn = framed(stream, 1024 * 1024);
    send_message(&mut conn, &WireMessage::Heartbeat { timestamp: 1.0 }).await;

    let frame = conn.next().await.unwrap().unwrap();
    let reply: HandshakeReply = serde_json::from_slice(&frame).unwrap();
    assert_eq!(reply.status, HandshakeStatus::Rejected);
    assert!(reply.error.is_some());

    assert!(server.handle().connected_devices().await.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_command_ack_roundtrip() {
    let mut server = started(quick_config()).await;
    let mut events = server.subscribe();
    let port = server.port().unwrap();
    let handle = server.handle();

    let (mut conn, device_id) = connect_device(port, DeviceType::AndroidRgb, "pixel").await;

    let message_id = handle
        .send_command(
            &device_id,
            CommandKind::StartRecord,
            CommandParameters::for_session("sess-1", true, true, false),
            true,
        )
        .await
        .unwrap();

    let received = next_message(&mut conn).await;
    let WireMessage::Command {
        command,
        parameters,
        require_ack,
        message_id: wire_id,
        retry_attempt,
        ..
    } = received
    else {
        panic!("expected command");
    };
    assert_eq!(command, CommandKind::StartRecord);
    assert_eq!(parameters.session_id.as_deref(), Some("sess-1"));
    assert!(parameters.record_video);
    assert!(!parameters.record_shimmer);
    assert!(require_ack);
    assert_eq!(wire_id, message_id);
    assert_eq!(retry_attempt, None);

    send_message(
        &mut conn,
        &WireMessage::Acknowledgment {
            message_id: message_id.clone(),
            success: true,
            timestamp: unix_now(),
        },
    )
    .await;

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ServerEvent::CommandAcknowledged { .. })
    })
    .await;
    let ServerEvent::CommandAcknowledged {
        message_id: acked, ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(acked, message_id);
    assert_eq!(handle.pending_acknowledgments().await, 0);

    // The observed round trip fed the device's latency window
    let stats = handle.device_statistics(&device_id).await.unwrap();
    assert_eq!(stats.latency_sample_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_unacked_command_retries_then_fails() {
    let mut server = started(quick_config()).await;
    let mut events = server.subscribe();
    let port = server.port().unwrap();
    let handle = server.handle();

    let (mut conn, device_id) = connect_device(port, DeviceType::AndroidRgb, "pixel").await;

    handle
        .send_command(
            &device_id,
            CommandKind::StartRecord,
            CommandParameters::default(),
            true,
        )
        .await
        .unwrap();

    // Initial send, then exactly max_attempts - 1 = 2 retries
    let first = next_message(&mut conn).await;
    assert!(matches!(
        first,
        WireMessage::Command {
            retry_attempt: None,
            ..
        }
    ));
    let second = next_message(&mut conn).await;
    assert!(matches!(
        second,
        WireMessage::Command {
            retry_attempt: Some(2),
            ..
        }
    ));
    let third = next_message(&mut conn).await;
    assert!(matches!(
        third,
        WireMessage::Command {
            retry_attempt: Some(3),
            ..
        }
    ));

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ServerEvent::DeliveryFailed { .. })
    })
    .await;
    let ServerEvent::DeliveryFailed { attempts, .. } = event else {
        unreachable!()
    };
    assert_eq!(attempts, 3);
    assert_eq!(handle.pending_acknowledgments().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_send_command_to_unknown_device() {
    let mut server = started(quick_config()).await;
    let handle = server.handle();

    let result = handle
        .send_command(
            "android-99",
            CommandKind::StartRecord,
            CommandParameters::default(),
            true,
        )
        .await;

    assert!(matches!(result, Err(SyncError::DeviceNotFound { .. })));
    server.stop().await;
}

#[tokio::test]
async fn test_rate_limited_connection_dropped() {
    let config = CommandServerConfig {
        max_requests_per_minute: 2,
        ..quick_config()
    };
    let mut server = started(config).await;
    let port = server.port().unwrap();

    let (_a, _) = connect_device(port, DeviceType::AndroidRgb, "one").await;
    let (_b, _) = connect_device(port, DeviceType::AndroidRgb, "two").await;

    // Third connection from the same source inside the window is dropped
    // before any handshake exchange.
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut conn = framed(stream, 1024 * 1024);
    let closed = tokio::time::timeout(Duration::from_secs(2), conn.next()).await;
    assert!(matches!(closed, Ok(None) | Ok(Some(Err(_)))));

    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_message_deregisters() {
    let mut server = started(quick_config()).await;
    let mut events = server.subscribe();
    let port = server.port().unwrap();

    let (mut conn, device_id) = connect_device(port, DeviceType::Gsr, "bridge").await;
    send_message(
        &mut conn,
        &WireMessage::Disconnect {
            reason: "battery died".to_string(),
            timestamp: unix_now(),
        },
    )
    .await;

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ServerEvent::DeviceDisconnected { .. })
    })
    .await;
    let ServerEvent::DeviceDisconnected {
        device_id: gone,
        reason,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(gone, device_id);
    assert_eq!(reason, "battery died");

    assert!(server.handle().connected_devices().await.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_silent_device_deregistered_by_liveness() {
    let config = CommandServerConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..quick_config()
    };
    let mut server = started(config).await;
    let mut events = server.subscribe();
    let port = server.port().unwrap();

    let (_conn, device_id) = connect_device(port, DeviceType::Thermal, "flir").await;

    // No traffic after the handshake: the sweeper declares it dead after
    // 2x the heartbeat interval.
    let event = wait_for_event(&mut events, |e| {
        matches!(e, ServerEvent::DeviceDisconnected { .. })
    })
    .await;
    let ServerEvent::DeviceDisconnected {
        device_id: gone,
        reason,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(gone, device_id);
    assert_eq!(reason, "heartbeat timeout");

    server.stop().await;
}

#[tokio::test]
async fn test_heartbeats_keep_device_alive() {
    let config = CommandServerConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..quick_config()
    };
    let mut server = started(config).await;
    let port = server.port().unwrap();

    let (mut conn, device_id) = connect_device(port, DeviceType::AndroidRgb, "pixel").await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        send_message(&mut conn, &WireMessage::Heartbeat { timestamp: unix_now() }).await;
    }

    let connected = server.handle().connected_devices().await;
    assert_eq!(connected, vec![device_id]);

    server.stop().await;
}

#[tokio::test]
async fn test_broadcast_command() {
    let mut server = started(quick_config()).await;
    let port = server.port().unwrap();
    let handle = server.handle();

    let (mut conn_a, _) = connect_device(port, DeviceType::AndroidRgb, "one").await;
    let (mut conn_b, _) = connect_device(port, DeviceType::AndroidRgb, "two").await;

    let sent = handle
        .broadcast_command(CommandKind::StopRecord, CommandParameters::default(), false)
        .await;
    assert_eq!(sent, 2);

    for conn in [&mut conn_a, &mut conn_b] {
        let message = next_message(conn).await;
        assert!(matches!(
            message,
            WireMessage::Command {
                command: CommandKind::StopRecord,
                ..
            }
        ));
    }

    server.stop().await;
}

#[tokio::test]
async fn test_capability_negotiation_intersection() {
    let mut server = started(quick_config()).await;
    let port = server.port().unwrap();
    let handle = server.handle();

    // Declares "recording" (shared), "magic" (unknown to the server)
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut conn = framed(stream, 1024 * 1024);
    send_message(
        &mut conn,
        &WireMessage::Handshake {
            device_info: DeviceInfo::new(DeviceType::AndroidRgb, "pixel"),
            capabilities: vec!["recording".to_string(), "magic".to_string()],
            timestamp: unix_now(),
        },
    )
    .await;
    let frame = conn.next().await.unwrap().unwrap();
    let reply: HandshakeReply = serde_json::from_slice(&frame).unwrap();
    let device_id = reply.device_id.unwrap();

    let requested = vec![
        "recording".to_string(),
        "magic".to_string(),
        "calibration".to_string(),
    ];
    let status = handle
        .negotiate_capabilities(&device_id, &requested)
        .await
        .unwrap();

    assert_eq!(status["recording"], true);
    // Server does not support it
    assert_eq!(status["magic"], false);
    // Device did not declare it
    assert_eq!(status["calibration"], false);

    let message = next_message(&mut conn).await;
    let WireMessage::CapabilityNegotiation {
        requested_capabilities,
        supported_capabilities,
        ..
    } = message
    else {
        panic!("expected capability_negotiation");
    };
    assert_eq!(requested_capabilities, requested);
    assert!(supported_capabilities.contains(&"recording".to_string()));

    server.stop().await;
}

#[tokio::test]
async fn test_network_statistics_aggregate() {
    let mut server = started(quick_config()).await;
    let port = server.port().unwrap();
    let handle = server.handle();

    assert_eq!(handle.network_statistics().await.quality, NetworkQuality::Unknown);

    let (mut conn, device_id) = connect_device(port, DeviceType::AndroidRgb, "pixel").await;
    let message_id = handle
        .send_command(&device_id, CommandKind::StartRecord, CommandParameters::default(), true)
        .await
        .unwrap();
    let _ = next_message(&mut conn).await;
    send_message(
        &mut conn,
        &WireMessage::Acknowledgment {
            message_id,
            success: true,
            timestamp: unix_now(),
        },
    )
    .await;

    // Wait until the ack is ingested
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if handle.pending_acknowledgments().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let stats = handle.network_statistics().await;
    assert_eq!(stats.active_devices, 1);
    assert!(stats.total_messages >= 2);
    assert!(stats.total_bytes > 0);
    assert_ne!(stats.quality, NetworkQuality::Unknown);

    server.stop().await;
}
