use std::time::Duration;

use tokio::net::UdpSocket;

use crate::timeref::ntp::{
    build_client_packet, parse_server_packet, query_host, NtpTimestamp,
};

#[test]
fn test_ntp_timestamp_now() {
    let ts = NtpTimestamp::now();

    // Should be after year 2020 in NTP time
    // 2020 in NTP = 3786825600 (seconds since 1900)
    assert!(ts.seconds > 3_786_825_600);
}

#[test]
fn test_ntp_timestamp_roundtrip() {
    let original = NtpTimestamp {
        seconds: 12_345_678,
        fraction: 0xABCD_EF00,
    };

    let restored = NtpTimestamp::from_u64(original.to_u64());
    assert_eq!(original, restored);
}

#[test]
fn test_to_unix_half_second_fraction() {
    // 0x8000_0000 is exactly 0.5 s in NTP fraction
    let ts = NtpTimestamp {
        seconds: 2_208_988_800 + 100, // 100 s after the unix epoch
        fraction: 0x8000_0000,
    };

    let unix = ts.to_unix();
    assert!((unix - 100.5).abs() < 1e-6);
}

#[test]
fn test_client_packet_layout() {
    let transmit = NtpTimestamp {
        seconds: 1000,
        fraction: 42,
    };
    let packet = build_client_packet(transmit);

    assert_eq!(packet.len(), 48);
    // LI=0, VN=3, Mode=3 (client)
    assert_eq!(packet[0], 0x1B);
    // Transmit timestamp occupies the final 8 bytes
    let echoed = u64::from_be_bytes(packet[40..48].try_into().unwrap());
    assert_eq!(echoed, transmit.to_u64());
}

#[test]
fn test_parse_rejects_short_packet() {
    assert!(parse_server_packet(&[0u8; 32]).is_none());
}

#[test]
fn test_parse_rejects_wrong_mode() {
    let mut packet = [0u8; 48];
    packet[0] = 0x1B; // client mode, not server
    assert!(parse_server_packet(&packet).is_none());
}

#[test]
fn test_parse_extracts_timestamps() {
    let mut packet = [0u8; 48];
    packet[0] = 0x1C; // LI=0, VN=3, Mode=4 (server)

    let originate = NtpTimestamp {
        seconds: 100,
        fraction: 0,
    };
    let receive = NtpTimestamp {
        seconds: 200,
        fraction: 0,
    };
    let transmit = NtpTimestamp {
        seconds: 300,
        fraction: 0,
    };
    packet[24..32].copy_from_slice(&originate.to_u64().to_be_bytes());
    packet[32..40].copy_from_slice(&receive.to_u64().to_be_bytes());
    packet[40..48].copy_from_slice(&transmit.to_u64().to_be_bytes());

    let server = parse_server_packet(&packet).unwrap();
    assert_eq!(server.originate, originate);
    assert_eq!(server.receive, receive);
    assert_eq!(server.transmit, transmit);
}

/// Loopback SNTP responder answering with the given clock offset
pub(super) async fn spawn_upstream(offset_secs: f64) -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            if len < 48 {
                continue;
            }
            // The 64-bit NTP value is seconds << 32, so shifting by
            // offset * 2^32 moves the clock by whole offset seconds.
            let now = NtpTimestamp::now();
            let shifted = NtpTimestamp::from_u64(
                now.to_u64()
                    .wrapping_add((offset_secs * 4_294_967_296.0) as i64 as u64),
            );

            let mut response = [0u8; 48];
            response[0] = 0x1C; // server mode
            // Echo the client transmit time as originate
            response[24..32].copy_from_slice(&buf[40..48]);
            response[32..40].copy_from_slice(&shifted.to_u64().to_be_bytes());
            response[40..48].copy_from_slice(&shifted.to_u64().to_be_bytes());
            let _ = socket.send_to(&response, peer).await;
        }
    });

    addr.to_string()
}

#[tokio::test]
async fn test_query_host_measures_offset() {
    // Upstream running 2 s ahead of the local clock
    let addr = spawn_upstream(2.0).await;

    let sample = query_host(&addr, Duration::from_secs(1)).await.unwrap();

    assert!(
        sample.offset > 1.5 && sample.offset < 2.5,
        "offset {} not near 2s",
        sample.offset
    );
    assert!(sample.delay >= 0.0);
    assert!(sample.delay < 1.0);
}

#[tokio::test]
async fn test_query_host_times_out() {
    // Nothing is listening here
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    drop(socket);

    let result = query_host(&addr, Duration::from_millis(100)).await;
    assert!(result.is_err());
}
