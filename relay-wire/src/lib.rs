//! Length-prefixed binary framing for the chat relay wire protocol.
//!
//! Every frame on the wire is `size:u32-LE | id:i32-LE | type:i32-LE | payload:bytes | 00 00`,
//! where `size` counts the whole frame including itself and the trailing NULs. This module
//! only concerns itself with the framing layer: assembling/disassembling frames from bytes.
//! Payload interpretation belongs to `relay-core` and `relay-server`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read};

/// Bytes occupied by the `size|id|type` header plus the trailing NULs, excluding payload.
pub const HEADER_AND_TRAILER_SIZE: usize = 4 + 4 + 4 + 2;

/// Caller-chosen ids are non-negative; the server reserves negative ids for generated errors.
pub const ERR_PROTOCOL: i32 = -1;
pub const ERR_INVALID_FIELD: i32 = -2;
pub const ERR_CAPACITY: i32 = -3;

/// Frame type discriminants (`type` field on the wire). See `spec.md` §4.1.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum FrameType {
    SvrConnect = 1,
    SvrDisconnect = 2,
    SvrMessage = 3,
    ChConnect = 4,
    ChDisconnect = 5,
    ChMessage = 6,
    ChCommand = 7,
    ChDestroy = 8,
}

impl FrameType {
    #[inline]
    pub fn from_i32(value: i32) -> Result<FrameType, ProtocolError> {
        Ok(match value {
            1 => FrameType::SvrConnect,
            2 => FrameType::SvrDisconnect,
            3 => FrameType::SvrMessage,
            4 => FrameType::ChConnect,
            5 => FrameType::ChDisconnect,
            6 => FrameType::ChMessage,
            7 => FrameType::ChCommand,
            8 => FrameType::ChDestroy,
            other => return Err(ProtocolError::UnknownFrameType(other)),
        })
    }
}

impl From<FrameType> for i32 {
    #[inline]
    fn from(ty: FrameType) -> Self {
        ty as i32
    }
}

/// Command codes carried as the first byte of a `CH_COMMAND` payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum CommandCode {
    Rename = 1,
    Pin = 2,
    PromoteEmperor = 3,
    PromoteMod = 4,
    Kick = 5,
    Invite = 6,
    Privacy = 7,
}

impl CommandCode {
    #[inline]
    pub fn from_u8(value: u8) -> Result<CommandCode, ProtocolError> {
        Ok(match value {
            1 => CommandCode::Rename,
            2 => CommandCode::Pin,
            3 => CommandCode::PromoteEmperor,
            4 => CommandCode::PromoteMod,
            5 => CommandCode::Kick,
            6 => CommandCode::Invite,
            7 => CommandCode::Privacy,
            other => return Err(ProtocolError::UnknownCommandCode(other)),
        })
    }
}

/// A single parsed protocol frame, trailing NULs already stripped from `payload`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub id: i32,
    pub frame_type: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    #[inline]
    pub fn new(id: i32, frame_type: impl Into<i32>, payload: impl Into<Vec<u8>>) -> Frame {
        Frame {
            id,
            frame_type: frame_type.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum ProtocolError {
    /// Frame claimed a `size` smaller than the minimum header+trailer size.
    FrameTooShort,
    /// Frame claimed a `size` larger than the configured maximum.
    FrameTooLarge { size: u32, max: usize },
    /// Trailing bytes were not the required `00 00`.
    MissingTrailer,
    UnknownFrameType(i32),
    UnknownCommandCode(u8),
    /// A string field contained a NUL byte, or otherwise was not valid UTF-8.
    InvalidField,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::FrameTooShort => write!(f, "frame size smaller than header"),
            ProtocolError::FrameTooLarge { size, max } => {
                write!(f, "frame size {size} exceeds maximum {max}")
            }
            ProtocolError::MissingTrailer => write!(f, "frame missing trailing NUL bytes"),
            ProtocolError::UnknownFrameType(ty) => write!(f, "unknown frame type {ty}"),
            ProtocolError::UnknownCommandCode(code) => write!(f, "unknown command code {code}"),
            ProtocolError::InvalidField => write!(f, "invalid field in payload"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Encode a frame to its on-wire byte representation.
#[inline]
pub fn encode(id: i32, frame_type: impl Into<i32>, payload: &[u8]) -> Vec<u8> {
    let total_size = HEADER_AND_TRAILER_SIZE + payload.len();
    let mut out = Vec::with_capacity(total_size);
    out.write_u32::<LittleEndian>(total_size as u32)
        .expect("writing to a Vec cannot fail");
    out.write_i32::<LittleEndian>(id).expect("writing to a Vec cannot fail");
    out.write_i32::<LittleEndian>(frame_type.into())
        .expect("writing to a Vec cannot fail");
    out.extend_from_slice(payload);
    out.push(0);
    out.push(0);
    out
}

/// Result of attempting to decode one frame from the front of a buffer.
pub enum DecodeOutcome {
    /// A complete frame was parsed; `consumed` bytes should be dropped from the buffer.
    Frame { frame: Frame, consumed: usize },
    /// Not enough bytes are buffered yet to know, or to complete, the frame.
    Incomplete,
}

/// Parse one frame from the front of `buf`, if possible. Does not mutate `buf`; the caller
/// is responsible for advancing past `consumed` bytes on [`DecodeOutcome::Frame`].
pub fn decode_one(buf: &[u8], max_frame_size: usize) -> Result<DecodeOutcome, ProtocolError> {
    if buf.len() < 4 {
        return Ok(DecodeOutcome::Incomplete);
    }

    let mut size_bytes = &buf[..4];
    let size = size_bytes.read_u32::<LittleEndian>().expect("slice has 4 bytes");

    if (size as usize) < HEADER_AND_TRAILER_SIZE {
        return Err(ProtocolError::FrameTooShort);
    }
    if size as usize > max_frame_size {
        return Err(ProtocolError::FrameTooLarge { size, max: max_frame_size });
    }

    let total = size as usize;
    if buf.len() < total {
        return Ok(DecodeOutcome::Incomplete);
    }

    let mut rest = &buf[4..total];
    let id = rest.read_i32::<LittleEndian>().expect("checked above");
    let frame_type = rest.read_i32::<LittleEndian>().expect("checked above");

    let payload_len = total - HEADER_AND_TRAILER_SIZE;
    let payload = rest[..payload_len].to_vec();
    let trailer = &rest[payload_len..];

    if trailer != [0u8, 0u8] {
        return Err(ProtocolError::MissingTrailer);
    }

    Ok(DecodeOutcome::Frame {
        frame: Frame { id, frame_type, payload },
        consumed: total,
    })
}

/// Outcome of reading one frame directly off a blocking (or blocking-like) reader.
#[derive(Debug)]
pub enum FrameReadOutcome {
    Frame(Frame),
    /// The underlying read would have blocked before a complete frame was available.
    ShortRead,
    /// The connection is no longer usable; the caller should tear it down.
    Fatal,
}

/// Read exactly one frame from `reader`. Intended for blocking readers (used directly by
/// tests and by any caller that prefers synchronous semantics); the non-blocking mio path
/// in `relay-server` instead buffers bytes itself and calls [`decode_one`] directly.
pub fn read_frame<R: Read>(reader: &mut R, max_frame_size: usize) -> FrameReadOutcome {
    let mut size_buf = [0u8; 4];
    match reader.read_exact(&mut size_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return FrameReadOutcome::ShortRead,
        Err(_) => return FrameReadOutcome::Fatal,
    }

    let size = (&size_buf[..]).read_u32::<LittleEndian>().expect("4 bytes");
    if (size as usize) < HEADER_AND_TRAILER_SIZE || size as usize > max_frame_size {
        return FrameReadOutcome::Fatal;
    }

    let remaining = size as usize - 4;
    let mut rest = vec![0u8; remaining];
    match reader.read_exact(&mut rest) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return FrameReadOutcome::ShortRead,
        Err(_) => return FrameReadOutcome::Fatal,
    }

    let mut cursor = &rest[..];
    let id = match cursor.read_i32::<LittleEndian>() {
        Ok(v) => v,
        Err(_) => return FrameReadOutcome::Fatal,
    };
    let frame_type = match cursor.read_i32::<LittleEndian>() {
        Ok(v) => v,
        Err(_) => return FrameReadOutcome::Fatal,
    };

    let payload_len = remaining - 4 - 4 - 2;
    let payload = cursor[..payload_len].to_vec();
    let trailer = &cursor[payload_len..];
    if trailer != [0u8, 0u8] {
        return FrameReadOutcome::Fatal;
    }

    FrameReadOutcome::Frame(Frame { id, frame_type, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode_roundtrip() {
        let bytes = encode(7, FrameType::ChMessage, b"hello");
        match decode_one(&bytes, 4096).unwrap() {
            DecodeOutcome::Frame { frame, consumed } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(frame.id, 7);
                assert_eq!(frame.frame_type, FrameType::ChMessage as i32);
                assert_eq!(frame.payload, b"hello");
            }
            DecodeOutcome::Incomplete => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let bytes = encode(1, FrameType::SvrConnect, b"bunny");
        let outcome = decode_one(&bytes[..bytes.len() - 1], 4096).unwrap();
        assert!(matches!(outcome, DecodeOutcome::Incomplete));
    }

    #[test]
    fn test_decode_empty_payload() {
        let bytes = encode(0, FrameType::ChDisconnect, &[]);
        match decode_one(&bytes, 4096).unwrap() {
            DecodeOutcome::Frame { frame, .. } => assert!(frame.payload.is_empty()),
            DecodeOutcome::Incomplete => panic!(),
        }
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let bytes = encode(1, FrameType::ChMessage, &vec![0u8; 100]);
        let err = decode_one(&bytes, 32).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_decode_rejects_undersized_size_field() {
        let mut bytes = encode(1, FrameType::ChMessage, b"x");
        bytes[0] = 1; // shrink the declared size below the header+trailer minimum
        let err = decode_one(&bytes, 4096).unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooShort);
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut bytes = encode(1, FrameType::SvrConnect, b"a");
        bytes.extend(encode(2, FrameType::SvrConnect, b"bb"));

        let (first, consumed) = match decode_one(&bytes, 4096).unwrap() {
            DecodeOutcome::Frame { frame, consumed } => (frame, consumed),
            DecodeOutcome::Incomplete => panic!(),
        };
        assert_eq!(first.id, 1);

        let second = match decode_one(&bytes[consumed..], 4096).unwrap() {
            DecodeOutcome::Frame { frame, .. } => frame,
            DecodeOutcome::Incomplete => panic!(),
        };
        assert_eq!(second.id, 2);
        assert_eq!(second.payload, b"bb");
    }

    #[test]
    fn test_read_frame_from_blocking_reader() {
        let bytes = encode(9, FrameType::ChMessage, b"ping");
        let mut cursor = Cursor::new(bytes);
        match read_frame(&mut cursor, 4096) {
            FrameReadOutcome::Frame(frame) => {
                assert_eq!(frame.id, 9);
                assert_eq!(frame.payload, b"ping");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_read_frame_fatal_on_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        match read_frame::<Cursor<Vec<u8>>>(&mut cursor, 4096) {
            FrameReadOutcome::Fatal => {}
            other => panic!("expected Fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_type_round_trip() {
        for ty in [
            FrameType::SvrConnect,
            FrameType::SvrDisconnect,
            FrameType::SvrMessage,
            FrameType::ChConnect,
            FrameType::ChDisconnect,
            FrameType::ChMessage,
            FrameType::ChCommand,
            FrameType::ChDestroy,
        ] {
            let raw: i32 = ty.into();
            assert_eq!(FrameType::from_i32(raw).unwrap(), ty);
        }
        assert!(FrameType::from_i32(99).is_err());
    }

    #[test]
    fn test_command_code_round_trip() {
        for code in [
            CommandCode::Rename,
            CommandCode::Pin,
            CommandCode::PromoteEmperor,
            CommandCode::PromoteMod,
            CommandCode::Kick,
            CommandCode::Invite,
            CommandCode::Privacy,
        ] {
            let raw = code as u8;
            assert_eq!(CommandCode::from_u8(raw).unwrap() as u8, raw);
        }
        assert!(CommandCode::from_u8(0).is_err());
    }
}
