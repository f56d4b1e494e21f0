use super::{AssetProvider, AssetReader, AssetRef};
use crate::error::{Result, SyncError};
use crate::protocol::MediaKind;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A directory tree used as a media library.
///
/// Asset ids are paths relative to the root, `/`-separated.
pub struct FsAssetProvider {
    root: PathBuf,
}

impl FsAssetProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Describe a single file under the root, with the same id a listing
    /// would give it.
    pub async fn asset_at(&self, path: &Path) -> Result<AssetRef> {
        let root = fs::canonicalize(&self.root).await.map_err(|e| {
            SyncError::Asset(format!("cannot resolve {}: {}", self.root.display(), e))
        })?;
        let full = fs::canonicalize(path)
            .await
            .map_err(|e| SyncError::Asset(format!("cannot resolve {}: {}", path.display(), e)))?;
        let kind = media_kind(&full).ok_or_else(|| {
            SyncError::Asset(format!("not a photo or video: {}", path.display()))
        })?;
        let id = relative_id(&root, &full).ok_or_else(|| {
            SyncError::Asset(format!("{} is outside {}", path.display(), root.display()))
        })?;
        let metadata = fs::metadata(&full).await?;
        if !metadata.is_file() {
            return Err(SyncError::Asset(format!("not a file: {}", path.display())));
        }
        Ok(AssetRef {
            id,
            kind,
            size: metadata.len(),
        })
    }

    fn path_of(&self, asset: &AssetRef) -> Result<PathBuf> {
        if asset.id.split('/').any(|part| part == "..") {
            return Err(SyncError::Asset(format!("asset id escapes root: {}", asset.id)));
        }
        Ok(self.root.join(&asset.id))
    }
}

/// Kind and mime type by file extension
fn classify(path: &Path) -> Option<(MediaKind, &'static str)> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let found = match ext.as_str() {
        "jpg" | "jpeg" => (MediaKind::Photo, "image/jpeg"),
        "png" => (MediaKind::Photo, "image/png"),
        "gif" => (MediaKind::Photo, "image/gif"),
        "webp" => (MediaKind::Photo, "image/webp"),
        "heic" => (MediaKind::Photo, "image/heic"),
        "heif" => (MediaKind::Photo, "image/heif"),
        "avif" => (MediaKind::Photo, "image/avif"),
        "bmp" => (MediaKind::Photo, "image/bmp"),
        "mp4" | "m4v" => (MediaKind::Video, "video/mp4"),
        "mov" => (MediaKind::Video, "video/quicktime"),
        "3gp" => (MediaKind::Video, "video/3gpp"),
        _ => return None,
    };
    Some(found)
}

/// Media kind of a file, judged by extension
pub fn media_kind(path: &Path) -> Option<MediaKind> {
    classify(path).map(|(kind, _)| kind)
}

/// Mime type of a file, judged by extension
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    classify(path).map(|(_, mime)| mime)
}

fn relative_id(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[async_trait]
impl AssetProvider for FsAssetProvider {
    async fn list_assets(&self, kind: MediaKind) -> Result<Vec<AssetRef>> {
        let mut assets = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| {
                SyncError::Asset(format!("cannot read {}: {}", dir.display(), e))
            })?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                match classify(&path) {
                    Some((k, _)) if k == kind => {}
                    _ => continue,
                }
                let Some(id) = relative_id(&self.root, &path) else {
                    continue;
                };
                let size = entry.metadata().await?.len();
                assets.push(AssetRef { id, kind, size });
            }
        }

        assets.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::debug!(
            "Found {} {} assets under {}",
            assets.len(),
            kind,
            self.root.display()
        );
        Ok(assets)
    }

    async fn open(&self, asset: &AssetRef) -> Result<AssetReader> {
        let path = self.path_of(asset)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| SyncError::Asset(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(Box::new(file))
    }

    async fn mime_type(&self, asset: &AssetRef) -> Option<String> {
        mime_for_path(Path::new(&asset.id)).map(str::to_string)
    }
}
