//! Wire protocol for the media server.
//!
//! Every message is one length-prefixed frame:
//!
//! ```text
//! +--------+----------------+-----------------+
//! | type:1 | length:4 (BE)  | payload[length] |
//! +--------+----------------+-----------------+
//! ```
//!
//! The protocol is strictly request/response with one request in flight.
//! Acks carry no correlation id; they are matched by content (`OK:<fileId>`),
//! which only works because responses arrive in submission order.

pub mod frame;
pub mod packet;

pub use frame::{decode, encode, Decoded, Frame, FrameBuffer, PacketType, HEADER_SIZE, MAX_FRAME_SIZE};
pub use packet::{
    acks_chunk, acks_file, acks_start, decode_media_count, ChunkedVideoComplete,
    ChunkedVideoData, ChunkedVideoStart, DownloadedMedia, MediaKind, MediaThumb, PhotoUpload,
    ServerMessage, ThumbListRequest, VideoUpload,
};
