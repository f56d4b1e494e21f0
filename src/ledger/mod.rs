//! Record of media already delivered to the server.

mod file;

pub use file::FileLedger;

use crate::error::Result;
use crate::protocol::MediaKind;
use chrono::{DateTime, Utc};

/// One synced item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    /// Wire file id
    pub id: String,
    pub kind: MediaKind,
    pub synced_at: DateTime<Utc>,
}

/// Persistent set of synced file ids.
///
/// Keyed by the wire file id, which is stable for a given asset.
pub trait SyncLedger: Send {
    fn is_synced(&self, id: &str) -> bool;

    fn record_synced(&mut self, id: &str, kind: MediaKind) -> Result<()>;

    /// Every record, ordered by id.
    fn all_synced(&self) -> Vec<SyncRecord>;

    fn clear(&mut self) -> Result<()>;
}
