//! Sync loop: upload every asset the ledger hasn't seen.

use crate::assets::{AssetProvider, AssetRef};
use crate::cancel::CancelToken;
use crate::config::TransferConfig;
use crate::engine::media_id::{file_id, SNIFF_LEN};
use crate::engine::{emit, EventSender, SyncClient, SyncEvent};
use crate::error::{Result, SyncError};
use crate::ledger::SyncLedger;
use crate::protocol::MediaKind;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// What happened to a single asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Uploaded,
    Skipped,
    Failed,
}

/// Outcome counts for one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.uploaded + self.skipped + self.failed
    }

    pub fn add(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Uploaded => self.uploaded += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: SyncReport) {
        self.uploaded += other.uploaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

pub struct MediaSync<'a> {
    client: &'a mut SyncClient,
    assets: &'a dyn AssetProvider,
    ledger: &'a mut dyn SyncLedger,
    transfer: TransferConfig,
}

impl<'a> MediaSync<'a> {
    pub fn new(
        client: &'a mut SyncClient,
        assets: &'a dyn AssetProvider,
        ledger: &'a mut dyn SyncLedger,
    ) -> Self {
        let transfer = client.transfer_config().clone();
        Self {
            client,
            assets,
            ledger,
            transfer,
        }
    }

    /// Sync photos, then videos.
    pub async fn sync_all(
        &mut self,
        cancel: &CancelToken,
        events: Option<&EventSender>,
    ) -> Result<SyncReport> {
        let mut report = self.sync_kind(MediaKind::Photo, cancel, events).await?;
        report.merge(self.sync_kind(MediaKind::Video, cancel, events).await?);
        Ok(report)
    }

    /// Upload every unsynced asset of `kind`.
    ///
    /// Item failures are counted and the pass continues; cancellation stops
    /// it with `Cancelled`.
    pub async fn sync_kind(
        &mut self,
        kind: MediaKind,
        cancel: &CancelToken,
        events: Option<&EventSender>,
    ) -> Result<SyncReport> {
        let assets = self.assets.list_assets(kind).await?;
        info!("Syncing {} {} assets", assets.len(), kind);
        let mut report = SyncReport::default();

        for asset in &assets {
            report.add(self.sync_asset(asset, cancel, events).await?);
        }

        info!(
            "{} sync done: {} uploaded, {} skipped, {} failed",
            kind, report.uploaded, report.skipped, report.failed
        );
        Ok(report)
    }

    /// Upload one asset unless the ledger already has it.
    ///
    /// Item failures come back as `ItemOutcome::Failed`. `Err` means
    /// cancellation or a failure outside the item (reconnect, ledger write).
    pub async fn sync_asset(
        &mut self,
        asset: &AssetRef,
        cancel: &CancelToken,
        events: Option<&EventSender>,
    ) -> Result<ItemOutcome> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let (id, reader) = match self.prepare(asset).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Skipping unreadable asset {}: {}", asset.id, e);
                emit(
                    events,
                    SyncEvent::Failed {
                        file_id: asset.id.clone(),
                        error: e.to_string(),
                    },
                );
                return Ok(ItemOutcome::Failed);
            }
        };

        if self.ledger.is_synced(&id) {
            debug!("{} already synced", id);
            emit(events, SyncEvent::Skipped { file_id: id });
            return Ok(ItemOutcome::Skipped);
        }

        if !self.client.is_connected() {
            self.client.force_reconnect().await?;
        }

        emit(
            events,
            SyncEvent::Started {
                file_id: id.clone(),
                total: asset.size,
            },
        );
        match self.upload(asset, &id, reader, cancel, events).await {
            Ok(()) => {
                self.ledger.record_synced(&id, asset.kind)?;
                emit(events, SyncEvent::Uploaded { file_id: id });
                Ok(ItemOutcome::Uploaded)
            }
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                warn!("Failed to upload {}: {}", id, e);
                emit(
                    events,
                    SyncEvent::Failed {
                        file_id: id,
                        error: e.to_string(),
                    },
                );
                Ok(ItemOutcome::Failed)
            }
        }
    }

    /// Open the asset and derive its wire id from the leading bytes.
    ///
    /// Returns a reader that still yields the whole content.
    async fn prepare(
        &self,
        asset: &AssetRef,
    ) -> Result<(String, Box<dyn AsyncRead + Send + Unpin>)> {
        let mut reader = self.assets.open(asset).await?;
        let mut head = Vec::with_capacity(SNIFF_LEN);
        (&mut reader)
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut head)
            .await?;
        let mime = self.assets.mime_type(asset).await;
        let id = file_id(&asset.id, &head, mime.as_deref(), asset.kind);
        let rest: Box<dyn AsyncRead + Send + Unpin> = Box::new(Cursor::new(head).chain(reader));
        Ok((id, rest))
    }

    async fn upload(
        &mut self,
        asset: &AssetRef,
        id: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        cancel: &CancelToken,
        events: Option<&EventSender>,
    ) -> Result<()> {
        match asset.kind {
            MediaKind::Video if asset.size > self.transfer.chunked_threshold => {
                self.client
                    .upload_chunked_video(id, reader, asset.size, cancel, events)
                    .await
            }
            kind => {
                let mut data = Vec::with_capacity(asset.size as usize);
                reader.read_to_end(&mut data).await?;
                match kind {
                    MediaKind::Photo => self.client.upload_photo(id, data, cancel).await,
                    MediaKind::Video => self.client.upload_video(id, data, cancel).await,
                }
            }
        }
    }
}
