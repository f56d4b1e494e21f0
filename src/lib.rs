//! Client for a LAN photo/video sync server.
//!
//! Finds servers by UDP broadcast, then talks a framed request/response
//! protocol over one flow-controlled TCP connection: uploads (with adaptive
//! chunking for large videos), media counts, thumbnail pages, deletes and
//! downloads.

pub mod assets;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod protocol;

pub use cancel::CancelToken;
pub use config::ClientConfig;
pub use connection::Connection;
pub use discovery::{discover, discover_stream, DeviceInfo};
pub use engine::{MediaSync, SyncClient, SyncEvent, SyncReport};
pub use error::{Result, SyncError};
pub use protocol::{Frame, MediaKind, PacketType};
