//! Wire framing.
//!
//! Frame format: type:u8 | len:u32 (big-endian) | payload[len]
//!
//! Decoding is incremental: a buffer holding less than a full frame yields
//! `Decoded::Incomplete` and the caller keeps buffering.

use crate::error::{Result, SyncError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the type + length prefix
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (256MB) - a larger length means the stream is corrupt
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

// =============================================================================
// Packet Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Photo = 1,
    Video = 2,
    /// Ack carrier, both directions
    SyncComplete = 3,
    SyncStart = 4,
    GetMediaCount = 5,
    MediaCountResponse = 6,
    MediaThumbList = 7,
    MediaThumbData = 8,
    MediaDeleteList = 9,
    MediaDeleteAck = 10,
    MediaDownloadList = 11,
    MediaDownloadAck = 12,
    ChunkedVideoStart = 13,
    ChunkedVideoData = 14,
    ChunkedVideoComplete = 15,
}

impl PacketType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Photo),
            2 => Some(Self::Video),
            3 => Some(Self::SyncComplete),
            4 => Some(Self::SyncStart),
            5 => Some(Self::GetMediaCount),
            6 => Some(Self::MediaCountResponse),
            7 => Some(Self::MediaThumbList),
            8 => Some(Self::MediaThumbData),
            9 => Some(Self::MediaDeleteList),
            10 => Some(Self::MediaDeleteAck),
            11 => Some(Self::MediaDownloadList),
            12 => Some(Self::MediaDownloadAck),
            13 => Some(Self::ChunkedVideoStart),
            14 => Some(Self::ChunkedVideoData),
            15 => Some(Self::ChunkedVideoComplete),
            _ => None,
        }
    }
}

// =============================================================================
// Frame
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        encode(self.packet_type, &self.payload)
    }

    /// Payload as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Result of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied
    Frame { frame: Frame, consumed: usize },
    /// Not enough bytes buffered yet
    Incomplete,
}

/// Encode a frame: 1-byte type, 4-byte big-endian length, payload.
pub fn encode(packet_type: PacketType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(packet_type as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode the first frame in `buf`.
///
/// Never panics on short input. An unknown type byte or an oversized length is
/// `MalformedFrame`; the stream is unrecoverable at that point.
pub fn decode(buf: &[u8]) -> Result<Decoded> {
    if buf.len() < HEADER_SIZE {
        return Ok(Decoded::Incomplete);
    }

    let mut header = &buf[..HEADER_SIZE];
    let type_byte = header.get_u8();
    let len = header.get_u32();

    let packet_type = PacketType::from_u8(type_byte)
        .ok_or_else(|| SyncError::MalformedFrame(format!("unknown packet type {}", type_byte)))?;

    if len > MAX_FRAME_SIZE {
        return Err(SyncError::MalformedFrame(format!(
            "frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let total = HEADER_SIZE + len as usize;
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    Ok(Decoded::Frame {
        frame: Frame {
            packet_type,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..total]),
        },
        consumed: total,
    })
}

// =============================================================================
// FrameBuffer
// =============================================================================

/// Accumulates inbound byte chunks and yields complete frames in order.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match decode(&self.buf)? {
            Decoded::Frame { frame, consumed } => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Decoded::Incomplete => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let encoded = encode(PacketType::SyncStart, b"pixel");
        assert_eq!(&encoded[..], &[4, 0, 0, 0, 5, b'p', b'i', b'x', b'e', b'l']);
    }

    #[test]
    fn test_empty_payload() {
        let encoded = encode(PacketType::GetMediaCount, &[]);
        assert_eq!(encoded.len(), HEADER_SIZE);

        match decode(&encoded).unwrap() {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(frame.packet_type, PacketType::GetMediaCount);
                assert!(frame.payload.is_empty());
                assert_eq!(consumed, HEADER_SIZE);
            }
            Decoded::Incomplete => panic!("Expected complete frame"),
        }
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let buf = [99u8, 0, 0, 0, 0];
        assert!(matches!(decode(&buf), Err(SyncError::MalformedFrame(_))));

        let buf = [0u8, 0, 0, 0, 0];
        assert!(matches!(decode(&buf), Err(SyncError::MalformedFrame(_))));
    }

    #[test]
    fn test_oversized_length_is_malformed() {
        let mut buf = vec![PacketType::Video as u8];
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        assert!(matches!(decode(&buf), Err(SyncError::MalformedFrame(_))));
    }

    #[test]
    fn test_trailing_bytes_left_for_next_frame() {
        let mut wire = encode(PacketType::SyncComplete, b"OK:a.jpg").to_vec();
        wire.extend_from_slice(&encode(PacketType::SyncComplete, b"OK:b.jpg"));
        wire.extend_from_slice(&[3, 0, 0]);

        let mut fb = FrameBuffer::new();
        fb.push(&wire);

        assert_eq!(fb.next_frame().unwrap().unwrap().payload_str(), "OK:a.jpg");
        assert_eq!(fb.next_frame().unwrap().unwrap().payload_str(), "OK:b.jpg");
        assert!(fb.next_frame().unwrap().is_none());
        assert_eq!(fb.len(), 3);
    }

    #[test]
    fn test_frame_buffer_byte_at_a_time() {
        let wire = encode(PacketType::MediaCountResponse, &172u32.to_be_bytes());
        let mut fb = FrameBuffer::new();

        for (i, b) in wire.iter().enumerate() {
            fb.push(&[*b]);
            let next = fb.next_frame().unwrap();
            if i + 1 < wire.len() {
                assert!(next.is_none());
            } else {
                let frame = next.unwrap();
                assert_eq!(frame.packet_type, PacketType::MediaCountResponse);
                assert_eq!(&frame.payload[..], &[0, 0, 0, 172]);
            }
        }
        assert!(fb.is_empty());
    }

    fn packet_type_strategy() -> impl Strategy<Value = PacketType> {
        (1u8..=15).prop_map(|b| PacketType::from_u8(b).unwrap())
    }

    proptest! {
        #[test]
        fn prop_roundtrip(t in packet_type_strategy(), payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let encoded = encode(t, &payload);
            match decode(&encoded).unwrap() {
                Decoded::Frame { frame, consumed } => {
                    prop_assert_eq!(frame.packet_type, t);
                    prop_assert_eq!(&frame.payload[..], &payload[..]);
                    prop_assert_eq!(consumed, encoded.len());
                }
                Decoded::Incomplete => prop_assert!(false, "complete frame decoded as incomplete"),
            }
        }

        #[test]
        fn prop_strict_prefix_is_incomplete(t in packet_type_strategy(), payload in proptest::collection::vec(any::<u8>(), 0..512), cut in any::<prop::sample::Index>()) {
            let encoded = encode(t, &payload);
            let cut = cut.index(encoded.len());
            prop_assert_eq!(decode(&encoded[..cut]).unwrap(), Decoded::Incomplete);
        }
    }
}
