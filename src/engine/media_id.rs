//! Stable per-asset file ids.
//!
//! The id is the cross-session key for ledger lookups, so it must come out the
//! same for the same asset on every run and differ between assets. The
//! extension is sniffed from the content's leading bytes, then taken from the
//! mime type, then defaulted by kind.

use crate::protocol::MediaKind;
use xxhash_rust::xxh3::xxh3_64;

/// Bytes of content needed to recognize every supported signature
pub const SNIFF_LEN: usize = 32;

/// Extension from leading content bytes, if recognized.
pub fn sniff_extension(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("jpg");
    }
    if head.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("png");
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some("gif");
    }
    if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return Some("webp");
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return ftyp_extension(&head[8..12]);
    }
    if head.starts_with(b"BM") && head.len() >= 6 {
        return Some("bmp");
    }
    None
}

/// ISO base media file: the major brand picks the container flavor.
fn ftyp_extension(brand: &[u8]) -> Option<&'static str> {
    match brand {
        b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" => Some("heic"),
        b"mif1" | b"msf1" | b"heif" => Some("heif"),
        b"avif" | b"avis" => Some("avif"),
        b"qt  " => Some("mov"),
        b"isom" | b"iso2" | b"iso4" | b"iso5" | b"iso6" | b"mp41" | b"mp42" | b"avc1"
        | b"dash" | b"MSNV" | b"M4V " | b"M4VH" | b"M4VP" => Some("mp4"),
        b"3gp4" | b"3gp5" | b"3gp6" | b"3g2a" => Some("3gp"),
        _ => None,
    }
}

/// Extension from a mime type, if known.
pub fn mime_extension(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/heic" => Some("heic"),
        "image/heif" => Some("heif"),
        "image/avif" => Some("avif"),
        "image/bmp" => Some("bmp"),
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/3gpp" => Some("3gp"),
        _ => None,
    }
}

pub fn default_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "jpg",
        MediaKind::Video => "mp4",
    }
}

/// Derive the wire file id for an asset.
///
/// An asset id that is already `<safe stem>.<ext>` maps to itself. Any other
/// id gets its sanitized stem plus a hash of the raw id, so two different
/// assets never share a file id.
pub fn file_id(asset_id: &str, head: &[u8], mime: Option<&str>, kind: MediaKind) -> String {
    let ext = sniff_extension(head)
        .or_else(|| mime.and_then(mime_extension))
        .unwrap_or_else(|| default_extension(kind));
    let (stem, original_ext) = split_extension(asset_id);
    let safe = sanitize_stem(stem);
    if safe == stem && original_ext == Some(ext) {
        return format!("{}.{}", safe, ext);
    }
    format!("{}_{:016x}.{}", safe, xxh3_64(asset_id.as_bytes()), ext)
}

/// Split off the extension of the last path component.
fn split_extension(asset_id: &str) -> (&str, Option<&str>) {
    match asset_id.rfind('.') {
        Some(dot) if dot > 0 && !asset_id[dot..].contains(['/', '\\']) => {
            (&asset_id[..dot], Some(&asset_id[dot + 1..]))
        }
        _ => (asset_id, None),
    }
}

/// Restrict to `[A-Za-z0-9_-]`.
fn sanitize_stem(stem: &str) -> String {
    let safe: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "asset".to_string()
    } else {
        safe
    }
}
