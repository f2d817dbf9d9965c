use serde_json::Value;

use crate::error::WireError;
use crate::proto::Frame;

/// Upper bound on an encoded frame. One frame is transmitted per socket
/// write and received with a single read of up to this many bytes. There is
/// no length prefix, so a frame split or coalesced by the transport fails
/// to parse and the reader drops the connection.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Encodes a frame for transmission.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let value = serde_json::to_value(frame).expect("Frame serialization failed");
    encode_value(&value)
}

/// Encodes an arbitrary JSON value, rejecting anything that is not an
/// object or that would overrun the wire cap.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, WireError> {
    if !value.is_object() {
        return Err(WireError::NotAnObject);
    }

    let bytes = serde_json::to_vec(value).expect("JSON serialization failed");

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::Oversize);
    }

    Ok(bytes)
}

/// Decodes one received frame. Undecodable input is [`WireError::Malformed`];
/// a well-formed object matching no recognised frame shape is
/// [`WireError::UnknownShape`].
pub fn decode(bytes: &[u8]) -> Result<Frame, WireError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| WireError::Malformed)?;

    if !value.is_object() {
        return Err(WireError::Malformed);
    }

    serde_json::from_value(value).map_err(|_| WireError::UnknownShape)
}
