//! Request/acknowledgment engine on top of a `Connection`.
//!
//! Every operation is `Idle -> Sent -> (Acked | TimedOut | Cancelled |
//! ConnectionClosed)`. Exactly one is in flight per connection; `SyncClient`
//! methods take `&mut self`, so the borrow checker serializes callers.

pub mod chunked;
pub mod client;
pub mod driver;
pub mod media_id;
pub mod timeout;

pub use chunked::ChunkedTransfer;
pub use client::SyncClient;
pub use driver::{ItemOutcome, MediaSync, SyncReport};
pub use timeout::response_timeout;

use tokio::sync::mpsc;

/// Progress and outcome notifications from uploads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started { file_id: String, total: u64 },
    Progress { file_id: String, sent: u64, total: u64 },
    Uploaded { file_id: String },
    Skipped { file_id: String },
    Failed { file_id: String, error: String },
}

pub type EventSender = mpsc::UnboundedSender<SyncEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send an event if anyone is listening.
pub(crate) fn emit(events: Option<&EventSender>, event: SyncEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
