//! Codec for encoding and decoding hpmon frames.
//!
//! Two encodings share one frame model:
//!
//! - **JSON** - one frame per WebSocket text message (what browser dashboards speak).
//! - **MessagePack** - length-prefixed frames carried in WebSocket binary messages.
//!
//! Decoding always follows the kind of message that arrived, so a peer can
//! read both encodings regardless of which one it writes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Event name not valid in this direction.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Frame encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON text messages.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary messages.
    #[serde(rename = "msgpack", alias = "messagepack")]
    MessagePack,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Json => f.write_str("json"),
            Encoding::MessagePack => f.write_str("msgpack"),
        }
    }
}

/// A transport-level message carrying one encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// JSON text.
    Text(String),
    /// Length-prefixed MessagePack.
    Binary(Bytes),
}

impl WireMessage {
    /// Size of the message in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(data) => data.len(),
        }
    }

    /// Check if the message is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The encoding this message was written in.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        match self {
            WireMessage::Text(_) => Encoding::Json,
            WireMessage::Binary(_) => Encoding::MessagePack,
        }
    }
}

/// Encode a frame as JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_json<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode a frame to length-prefixed MessagePack.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_msgpack<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_msgpack_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_msgpack_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_msgpack<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a MessagePack frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_msgpack_from<T: DeserializeOwned>(
    buf: &mut BytesMut,
) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

/// Encoder/decoder bound to an outbound encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    encoding: Encoding,
}

impl FrameCodec {
    /// Create a new codec that writes the given encoding.
    #[must_use]
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    /// The encoding used for outbound frames.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Switch the outbound encoding.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    /// Encode a frame in the configured encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode<T: Serialize>(&self, frame: &T) -> Result<WireMessage, ProtocolError> {
        match self.encoding {
            Encoding::Json => encode_json(frame).map(WireMessage::Text),
            Encoding::MessagePack => encode_msgpack(frame).map(WireMessage::Binary),
        }
    }

    /// Decode a single frame from a complete wire message.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode<T: DeserializeOwned>(&self, message: &WireMessage) -> Result<T, ProtocolError> {
        match message {
            WireMessage::Text(text) => decode_json(text),
            WireMessage::Binary(data) => decode_msgpack(data),
        }
    }

    /// Try to decode a MessagePack frame from a streaming buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is invalid.
    pub fn decode_from<T: DeserializeOwned>(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<T>, ProtocolError> {
        decode_msgpack_from(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ClientFrame, ServerFrame};
    use serde_json::json;

    #[test]
    fn test_msgpack_carries_json_payloads() {
        let frame = ServerFrame::metric_batch(
            json!({"temp_outside": 4.5, "compressor_on": true, "mode": "heating"})
                .as_object()
                .cloned()
                .unwrap(),
        );

        let encoded = encode_msgpack(&frame).unwrap();
        let decoded: ServerFrame = decode_msgpack(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_codec_decodes_by_message_kind() {
        let frame = ClientFrame::subscribe(["temp_flow"], Some("dash1"));

        let json_codec = FrameCodec::new(Encoding::Json);
        let msgpack_codec = FrameCodec::new(Encoding::MessagePack);

        let text = json_codec.encode(&frame).unwrap();
        let binary = msgpack_codec.encode(&frame).unwrap();
        assert_eq!(text.encoding(), Encoding::Json);
        assert_eq!(binary.encoding(), Encoding::MessagePack);

        // Either codec reads either encoding.
        let a: ClientFrame = msgpack_codec.decode(&text).unwrap();
        let b: ClientFrame = json_codec.decode(&binary).unwrap();
        assert_eq!(a, frame);
        assert_eq!(b, frame);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_msgpack(&ClientFrame::ping()).unwrap();

        match decode_msgpack::<ClientFrame>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut data = BytesMut::new();
        data.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode_msgpack::<ClientFrame>(&data) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = ClientFrame::subscribe(["a"], None);
        let frame2 = ClientFrame::ping();

        let mut buf = BytesMut::new();
        encode_msgpack_into(&frame1, &mut buf).unwrap();
        encode_msgpack_into(&frame2, &mut buf).unwrap();

        let decoded1: ClientFrame = decode_msgpack_from(&mut buf).unwrap().unwrap();
        let decoded2: ClientFrame = decode_msgpack_from(&mut buf).unwrap().unwrap();

        assert_eq!(frame1, decoded1);
        assert_eq!(frame2, decoded2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(decode_json::<ServerFrame>("{not json").is_err());
        assert!(matches!(
            decode_json::<ClientFrame>(r#"{"event":"shutdown"}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_encoding_names() {
        let e: Encoding = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(e, Encoding::MessagePack);
        let e: Encoding = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(e, Encoding::Json);
        assert_eq!(Encoding::MessagePack.to_string(), "msgpack");
    }
}
