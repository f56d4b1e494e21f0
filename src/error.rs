use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Codec-level failure; the byte stream can't be resynchronized.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection closed")]
    ConnectionClosed,

    /// Peer answered, but not with the expected acknowledgment.
    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Server unreachable at {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Asset error: {0}")]
    Asset(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the error leaves the connection unusable.
    ///
    /// Only a rejection keeps the connection open; every other failure means
    /// partial frame state may be on the wire.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Rejected(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
