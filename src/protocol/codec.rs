use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::message::WireMessage;
use crate::error::SyncError;

/// Wrap a device connection in the length-prefixed frame codec
///
/// Frames are a 4-byte big-endian length followed by a JSON object.
#[must_use]
pub fn framed(stream: TcpStream, max_frame_bytes: usize) -> Framed<TcpStream, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .max_frame_length(max_frame_bytes)
        .new_framed(stream)
}

/// Serialize a message into a frame payload
///
/// # Errors
/// Returns `SyncError::Codec` if serialization fails.
pub fn encode_message(message: &WireMessage) -> Result<Bytes, SyncError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a frame payload into a message
///
/// # Errors
/// Returns `SyncError::Codec` on malformed JSON or an unknown `type` tag.
pub fn decode_message(payload: &[u8]) -> Result<WireMessage, SyncError> {
    Ok(serde_json::from_slice(payload)?)
}
