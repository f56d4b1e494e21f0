//! Typed payloads for each packet type.
//!
//! Requests are JSON objects (UTF-8) except `SyncStart` (raw device name) and
//! `GetMediaCount` (empty). Server responses are decoded once, at the edge,
//! into a `ServerMessage` variant chosen by packet type.

use crate::error::{Result, SyncError};
use crate::protocol::frame::{Frame, PacketType};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Media kind
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[serde(alias = "image")]
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" | "image" => Some(MediaKind::Photo),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serde adapter: `Vec<u8>` <-> standard base64 string
mod b64 {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Client -> server payloads
// =============================================================================

/// PHOTO (1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoUpload {
    pub id: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    pub media: MediaKind,
}

/// VIDEO (2), single-frame mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoUpload {
    pub id: String,
    pub media: MediaKind,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// MEDIA_THUMB_LIST (7)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbListRequest {
    pub page_index: u32,
    pub page_size: u32,
}

/// CHUNKED_VIDEO_START (13)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedVideoStart {
    pub id: String,
    pub media: MediaKind,
    pub total_size: u64,
}

/// CHUNKED_VIDEO_DATA (14)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedVideoData {
    pub id: String,
    pub chunk_index: u32,
    pub size: usize,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// CHUNKED_VIDEO_COMPLETE (15)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedVideoComplete {
    pub id: String,
    pub total_bytes: u64,
}

/// Serialize any request payload to its JSON wire bytes.
pub fn to_json<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

// =============================================================================
// Server -> client payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MediaThumb {
    pub id: String,
    pub media: MediaKind,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ThumbPage {
    #[serde(default)]
    photos: Vec<MediaThumb>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedMedia {
    pub id: String,
    pub data: Vec<u8>,
}

/// A decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// SYNC_COMPLETE: ack string, possibly empty (terminal signal)
    Ack(String),
    /// MEDIA_COUNT_RESPONSE
    MediaCount(u64),
    /// MEDIA_THUMB_DATA
    Thumbs(Vec<MediaThumb>),
    /// MEDIA_DELETE_ACK: status string
    DeleteAck(String),
    /// MEDIA_DOWNLOAD_ACK
    Downloaded(Vec<DownloadedMedia>),
    /// A client->server packet type arriving from the server
    Unexpected(PacketType),
}

impl ServerMessage {
    pub fn decode(frame: &Frame) -> Result<Self> {
        match frame.packet_type {
            PacketType::SyncComplete => Ok(Self::Ack(frame.payload_str())),
            PacketType::MediaCountResponse => decode_media_count(&frame.payload).map(Self::MediaCount),
            PacketType::MediaThumbData => {
                let page: ThumbPage = serde_json::from_slice(&frame.payload)?;
                Ok(Self::Thumbs(page.photos))
            }
            PacketType::MediaDeleteAck => Ok(Self::DeleteAck(frame.payload_str())),
            PacketType::MediaDownloadAck => decode_download_ack(&frame.payload).map(Self::Downloaded),
            other => Ok(Self::Unexpected(other)),
        }
    }
}

/// Media count: 4- or 8-byte big-endian integer.
///
/// Older servers send the count as a UTF-8 decimal string; that form is still
/// accepted.
pub fn decode_media_count(payload: &[u8]) -> Result<u64> {
    match payload.len() {
        4 => Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64),
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(payload);
            Ok(u64::from_be_bytes(b))
        }
        _ => std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                SyncError::Rejected(format!("unparseable media count ({} bytes)", payload.len()))
            }),
    }
}

/// Download ack: JSON array of single-entry `{id: data_b64}` objects.
fn decode_download_ack(payload: &[u8]) -> Result<Vec<DownloadedMedia>> {
    let entries: Vec<BTreeMap<String, String>> = serde_json::from_slice(payload)?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        for (id, data) in entry {
            out.push(DownloadedMedia {
                id,
                data: BASE64.decode(data.as_bytes())?,
            });
        }
    }
    Ok(out)
}

// =============================================================================
// Acknowledgment matching
// =============================================================================

/// Whether an ack payload confirms `file_id` (`OK:<fileId>` anywhere in it).
pub fn acks_file(payload: &str, file_id: &str) -> bool {
    payload.contains(&format!("OK:{}", file_id))
}

/// Whether an ack payload confirms chunk `index` (`OK:CHUNK:<index>`).
///
/// The token must not be followed by another digit, so chunk 1 is not
/// confirmed by `OK:CHUNK:12`.
pub fn acks_chunk(payload: &str, index: u32) -> bool {
    let token = format!("OK:CHUNK:{}", index);
    payload.match_indices(&token).any(|(pos, _)| {
        !payload[pos + token.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// Whether an ack payload confirms the start of a chunked transfer.
pub fn acks_start(payload: &str, file_id: &str) -> bool {
    payload.contains("OK:START") || acks_file(payload, file_id)
}
