//! Frame layout for messages on a connection.
//!
//! Frame = `{u8 protocol_version, u32 little-endian body length, body}`.
//! The body starts with a varint stream ID (in the direction of travel)
//! followed by an encoded message.

use crate::coding::{put_varint64, Decoder};
use crate::error::ProtocolError;
use crate::message::Message;
use crate::types::StreamID;

/// Current protocol version written into every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size in octets of an encoded frame header.
pub const FRAME_HEADER_SIZE: usize = 1 + 4;

/// Upper bound on a frame body; anything larger is a protocol error.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub body_len: usize,
}

/// Encode a complete frame: header, stream ID, message.
pub fn encode_frame(version: u8, wire_stream: StreamID, message: &Message) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    put_varint64(&mut body, wire_stream);
    message.encode(&mut body);

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.push(version);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Parse a frame header. Rejects unknown versions and oversized bodies.
pub fn decode_header(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<FrameHeader, ProtocolError> {
    let version = buf[0];
    if version == 0 || version > PROTOCOL_VERSION {
        return Err(ProtocolError::InvalidFrameVersion(version));
    }
    let body_len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(FrameHeader { version, body_len })
}

/// Parse a frame body into the wire stream ID and the message it carries.
pub fn decode_body(body: &[u8]) -> Result<(StreamID, Message), ProtocolError> {
    let mut dec = Decoder::new(body);
    let wire_stream = dec.get_varint64("stream id")?;
    let consumed = body.len() - dec.remaining();
    let message = Message::decode(&body[consumed..])?;
    Ok((wire_stream, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageGoodbye, GoodbyeCode, OriginType};

    fn goodbye() -> Message {
        Message::Goodbye(MessageGoodbye {
            tenant_id: 1,
            code: GoodbyeCode::Graceful,
            origin_type: OriginType::Client,
        })
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(PROTOCOL_VERSION, 0x1234, &goodbye());
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        hdr.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        let header = decode_header(&hdr).unwrap();
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.body_len, frame.len() - FRAME_HEADER_SIZE);

        let (stream, message) = decode_body(&frame[FRAME_HEADER_SIZE..]).unwrap();
        assert_eq!(stream, 0x1234);
        assert_eq!(message, goodbye());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut frame = encode_frame(PROTOCOL_VERSION, 1, &goodbye());
        frame[0] = 0x7F;
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        hdr.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        assert!(decode_header(&hdr).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        hdr[0] = PROTOCOL_VERSION;
        hdr[1..5].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(decode_header(&hdr).is_err());
    }
}
