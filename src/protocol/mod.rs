//! JSON wire protocol shared by the time-reference service and the
//! device-command server
//!
//! Device connections carry length-prefixed frames (4-byte big-endian length
//! followed by a JSON object); time-sync connections carry a single raw JSON
//! request/response pair. Every message is decoded once at this boundary into
//! [`WireMessage`] so downstream code matches on a sum type instead of
//! string-comparing a `type` field.

mod codec;
mod message;

pub use codec::{decode_message, encode_message, framed};
pub use message::{
    CommandKind, CommandParameters, HandshakeReply, HandshakeStatus, ServerInfo, WireMessage,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix seconds
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
