//! Media library access.

pub mod fs;

pub use fs::FsAssetProvider;

use crate::error::Result;
use crate::protocol::MediaKind;
use async_trait::async_trait;
use tokio::io::AsyncRead;

/// One item in the local media library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    /// Provider-scoped identifier, stable across runs
    pub id: String,
    pub kind: MediaKind,
    pub size: u64,
}

pub type AssetReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait AssetProvider: Send + Sync {
    /// Every asset of `kind`, in a stable order.
    async fn list_assets(&self, kind: MediaKind) -> Result<Vec<AssetRef>>;

    async fn open(&self, asset: &AssetRef) -> Result<AssetReader>;

    async fn mime_type(&self, asset: &AssetRef) -> Option<String>;
}
