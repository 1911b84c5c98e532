//! SNTP client exchange with upstream time servers
//!
//! Implements the NTP-like timing exchange used to measure the local clock's
//! offset against each configured upstream host.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use tokio::net::UdpSocket;

use crate::error::SyncError;

/// NTP epoch offset from Unix epoch (seconds from 1900 to 1970)
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// SNTP v3 client request: LI=0, VN=3, Mode=3
const CLIENT_REQUEST_HEADER: u8 = 0x1B;

/// Server response mode bits
const SERVER_MODE: u8 = 4;

/// NTP timestamp (64-bit: 32 seconds + 32 fraction)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp {
    /// Seconds since NTP epoch (Jan 1, 1900)
    pub seconds: u32,
    /// Fractional part of seconds (1/2^32 resolution)
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Create from current system time
    #[must_use]
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        let seconds = now.as_secs() + NTP_EPOCH_OFFSET;
        let nanos = u64::from(now.subsec_nanos());
        let fraction = ((nanos << 32) / 1_000_000_000) as u32;

        Self {
            seconds: seconds as u32,
            fraction,
        }
    }

    /// Create from a 64-bit big-endian NTP timestamp
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// Convert to a 64-bit NTP timestamp
    #[must_use]
    pub fn to_u64(self) -> u64 {
        (u64::from(self.seconds) << 32) | u64::from(self.fraction)
    }

    /// Convert to unix seconds (fractional)
    #[must_use]
    pub fn to_unix(self) -> f64 {
        let secs = f64::from(self.seconds) - NTP_EPOCH_OFFSET as f64;
        secs + f64::from(self.fraction) / 4_294_967_296.0
    }
}

/// One successful upstream measurement
#[derive(Debug, Clone, Copy)]
pub struct NtpSample {
    /// Clock offset in seconds (server time minus local time)
    pub offset: f64,
    /// Round-trip delay in seconds
    pub delay: f64,
}

/// Build a 48-byte client request carrying the transmit timestamp
#[must_use]
pub fn build_client_packet(transmit: NtpTimestamp) -> [u8; 48] {
    let mut packet = [0u8; 48];
    packet[0] = CLIENT_REQUEST_HEADER;
    BigEndian::write_u64(&mut packet[40..48], transmit.to_u64());
    packet
}

/// Server-side timestamps extracted from a response packet
#[derive(Debug, Clone, Copy)]
pub struct ServerTimestamps {
    /// Echo of the client transmit time (t1)
    pub originate: NtpTimestamp,
    /// Server receive time (t2)
    pub receive: NtpTimestamp,
    /// Server transmit time (t3)
    pub transmit: NtpTimestamp,
}

/// Parse a server response, checking length and mode bits
#[must_use]
pub fn parse_server_packet(data: &[u8]) -> Option<ServerTimestamps> {
    if data.len() < 48 {
        return None;
    }
    if data[0] & 0x07 != SERVER_MODE {
        return None;
    }

    Some(ServerTimestamps {
        originate: NtpTimestamp::from_u64(BigEndian::read_u64(&data[24..32])),
        receive: NtpTimestamp::from_u64(BigEndian::read_u64(&data[32..40])),
        transmit: NtpTimestamp::from_u64(BigEndian::read_u64(&data[40..48])),
    })
}

/// Query one upstream host and measure offset and round-trip delay
///
/// Offset is `server_transmit − local_receive`; delay is the full NTP
/// `(t4 − t1) − (t3 − t2)` round trip.
///
/// # Errors
/// Returns `SyncError::UpstreamQuery` on timeout, an unparseable response,
/// or resolution failure; `SyncError::Io` on socket errors.
pub async fn query_host(host: &str, timeout: Duration) -> Result<NtpSample, SyncError> {
    let target = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:123")
    };

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&target).await?;

    let t1 = NtpTimestamp::now();
    socket.send(&build_client_packet(t1)).await?;

    let mut buf = [0u8; 64];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| SyncError::UpstreamQuery {
            host: host.to_string(),
            message: "query timed out".to_string(),
        })??;
    let t4 = NtpTimestamp::now();

    let server = parse_server_packet(&buf[..len]).ok_or_else(|| SyncError::UpstreamQuery {
        host: host.to_string(),
        message: "unparseable response packet".to_string(),
    })?;

    let offset = server.transmit.to_unix() - t4.to_unix();
    let delay = (t4.to_unix() - t1.to_unix())
        - (server.transmit.to_unix() - server.receive.to_unix());

    Ok(NtpSample {
        offset,
        delay: delay.max(0.0),
    })
}
