//! Sync protocol client.

use crate::cancel::CancelToken;
use crate::config::{ClientConfig, TransferConfig};
use crate::connection::Connection;
use crate::engine::chunked::ChunkedTransfer;
use crate::engine::timeout::response_timeout;
use crate::engine::{emit, EventSender, SyncEvent};
use crate::error::{Result, SyncError};
use crate::protocol::packet::to_json;
use crate::protocol::{
    acks_chunk, acks_file, acks_start, encode, ChunkedVideoComplete, ChunkedVideoData,
    ChunkedVideoStart, DownloadedMedia, Frame, FrameBuffer, MediaKind, MediaThumb, PacketType,
    PhotoUpload, ServerMessage, ThumbListRequest, VideoUpload,
};
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

pub struct SyncClient {
    conn: Connection,
    transfer: TransferConfig,
}

impl SyncClient {
    pub fn new(conn: Connection, transfer: TransferConfig) -> Self {
        Self { conn, transfer }
    }

    /// Connect to `host` on the configured server port.
    pub async fn connect(host: &str, config: &ClientConfig) -> Result<Self> {
        let conn = Connection::connect(host, config.server_port, config.connection.clone()).await?;
        Ok(Self::new(conn, config.transfer.clone()))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer
    }

    pub fn is_connected(&self) -> bool {
        !self.conn.is_closed()
    }

    pub fn disconnect(&mut self) {
        self.conn.disconnect();
    }

    pub async fn reconnect(&mut self) -> Result<()> {
        self.conn.reconnect().await
    }

    pub async fn force_reconnect(&mut self) -> Result<()> {
        self.conn.force_reconnect().await
    }

    // =========================================================================
    // Send and await
    // =========================================================================

    /// Send one frame and wait for exactly one response frame.
    ///
    /// Fails with `Timeout`, `Cancelled` or `ConnectionClosed`; any failure
    /// disconnects, since a half-read frame leaves no point to resync from.
    pub async fn send_packet_wait_ack(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Frame> {
        match self.exchange(packet_type, payload, timeout, cancel).await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                warn!("{:?} exchange failed: {}", packet_type, e);
                self.conn.disconnect();
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Frame> {
        if self.conn.is_closed() {
            return Err(SyncError::ConnectionClosed);
        }
        // Subscribe before sending so the response can't slip past
        let mut rx = self.conn.subscribe();
        let frame = encode(packet_type, payload);
        debug!("Sending {:?} ({} bytes)", packet_type, frame.len());
        self.submit(frame, cancel).await?;
        self.await_frame(&mut rx, timeout, cancel).await
    }

    /// Hand a whole frame to the connection.
    ///
    /// Frames over the split threshold go out in paced pieces and are fully
    /// flushed before this returns.
    async fn submit(&self, frame: Bytes, cancel: &CancelToken) -> Result<()> {
        if frame.len() <= self.transfer.split_threshold {
            return self.until_cancelled(self.conn.send_data(frame), cancel).await;
        }

        let piece_size = self.transfer.piece_size.max(1);
        let pieces = frame.len().div_ceil(piece_size);
        debug!("Splitting {} byte frame into {} pieces", frame.len(), pieces);
        let mut offset = 0;
        while offset < frame.len() {
            let end = (offset + piece_size).min(frame.len());
            self.until_cancelled(self.conn.send_data(frame.slice(offset..end)), cancel)
                .await?;
            offset = end;
            if offset < frame.len() {
                self.until_cancelled(async { Ok(sleep(self.transfer.piece_pause()).await) }, cancel)
                    .await?;
            }
        }
        self.until_cancelled(self.conn.wait_drained(), cancel).await
    }

    /// Run `fut`, checking `cancel` every poll interval.
    async fn until_cancelled<T, F>(&self, fut: F, cancel: &CancelToken) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::pin!(fut);
        let mut tick = interval(self.transfer.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = &mut fut => return res,
                _ = tick.tick() => {
                    if cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                }
            }
        }
    }

    async fn await_frame(
        &self,
        rx: &mut broadcast::Receiver<Bytes>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Frame> {
        let mut buffer = FrameBuffer::new();
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let mut tick = interval(self.transfer.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(chunk) => {
                        buffer.push(&chunk);
                        if let Some(frame) = buffer.next_frame()? {
                            if !buffer.is_empty() {
                                debug!("Discarding {} bytes after response frame", buffer.len());
                            }
                            return Ok(frame);
                        }
                    }
                    Err(e) => return Err(inbound_failure(e)),
                },
                _ = tick.tick() => {
                    if cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    if self.conn.is_closed() {
                        // Bytes read just before EOF may still be queued
                        loop {
                            match rx.try_recv() {
                                Ok(chunk) => buffer.push(&chunk),
                                Err(TryRecvError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                        return match buffer.next_frame()? {
                            Some(frame) => Ok(frame),
                            None => Err(SyncError::ConnectionClosed),
                        };
                    }
                }
                _ = &mut deadline => return Err(SyncError::Timeout(timeout)),
            }
        }
    }

    /// Decode a response. Undecodable content is a rejection, not a stream error.
    fn decode_response(frame: &Frame) -> Result<ServerMessage> {
        ServerMessage::decode(frame).map_err(|e| match e {
            SyncError::Json(_) | SyncError::Base64(_) => SyncError::Rejected(format!(
                "undecodable {:?} payload: {}",
                frame.packet_type, e
            )),
            other => other,
        })
    }

    /// Require a `SyncComplete` whose text satisfies `accepted`.
    fn expect_ack(frame: &Frame, accepted: impl Fn(&str) -> bool) -> Result<()> {
        match Self::decode_response(frame)? {
            ServerMessage::Ack(text) if accepted(&text) => Ok(()),
            ServerMessage::Ack(text) => {
                warn!("Unexpected ack: {:?}", text);
                Err(SyncError::Rejected(text))
            }
            other => Err(rejected(other)),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Announce this device. No response is expected.
    pub async fn send_sync_start(&mut self, device_name: &str) -> Result<()> {
        if self.conn.is_closed() {
            return Err(SyncError::ConnectionClosed);
        }
        info!("Starting sync session as {:?}", device_name);
        let frame = encode(PacketType::SyncStart, device_name.as_bytes());
        if let Err(e) = self.conn.send_data(frame).await {
            self.conn.disconnect();
            return Err(e);
        }
        Ok(())
    }

    pub async fn get_media_count(&mut self, cancel: &CancelToken) -> Result<u64> {
        let timeout = response_timeout(0, &self.transfer);
        let frame = self
            .send_packet_wait_ack(PacketType::GetMediaCount, &[], timeout, cancel)
            .await?;
        match Self::decode_response(&frame)? {
            ServerMessage::MediaCount(count) => {
                debug!("Server holds {} media items", count);
                Ok(count)
            }
            other => Err(rejected(other)),
        }
    }

    pub async fn get_media_thumb_list(
        &mut self,
        page_index: u32,
        page_size: u32,
        cancel: &CancelToken,
    ) -> Result<Vec<MediaThumb>> {
        let payload = to_json(&ThumbListRequest {
            page_index,
            page_size,
        })?;
        let timeout = response_timeout(payload.len(), &self.transfer);
        let frame = self
            .send_packet_wait_ack(PacketType::MediaThumbList, &payload, timeout, cancel)
            .await?;
        match Self::decode_response(&frame)? {
            ServerMessage::Thumbs(thumbs) => Ok(thumbs),
            other => Err(rejected(other)),
        }
    }

    /// Delete media on the server. Returns the server's status string.
    pub async fn delete_media(&mut self, ids: &[String], cancel: &CancelToken) -> Result<String> {
        let payload = to_json(&ids)?;
        let timeout = response_timeout(payload.len(), &self.transfer);
        let frame = self
            .send_packet_wait_ack(PacketType::MediaDeleteList, &payload, timeout, cancel)
            .await?;
        match Self::decode_response(&frame)? {
            ServerMessage::DeleteAck(status) if status_ok(&status) => {
                info!("Deleted {} items: {}", ids.len(), status.trim());
                Ok(status)
            }
            ServerMessage::DeleteAck(status) => Err(SyncError::Rejected(status)),
            other => Err(rejected(other)),
        }
    }

    pub async fn download_media(
        &mut self,
        ids: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<DownloadedMedia>> {
        let payload = to_json(&ids)?;
        let timeout = self.transfer.max_timeout_ms;
        let frame = self
            .send_packet_wait_ack(
                PacketType::MediaDownloadList,
                &payload,
                Duration::from_millis(timeout),
                cancel,
            )
            .await?;
        match Self::decode_response(&frame)? {
            ServerMessage::Downloaded(items) => Ok(items),
            other => Err(rejected(other)),
        }
    }

    pub async fn upload_photo(
        &mut self,
        file_id: &str,
        data: Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let size = data.len();
        let payload = to_json(&PhotoUpload {
            id: file_id.to_string(),
            data,
            media: MediaKind::Photo,
        })?;
        let timeout = response_timeout(payload.len(), &self.transfer);
        let frame = self
            .send_packet_wait_ack(PacketType::Photo, &payload, timeout, cancel)
            .await?;
        Self::expect_ack(&frame, |text| acks_file(text, file_id))?;
        info!("Uploaded {} ({} bytes)", file_id, size);
        Ok(())
    }

    /// Upload a video as a single frame.
    pub async fn upload_video(
        &mut self,
        file_id: &str,
        data: Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let size = data.len();
        let payload = to_json(&VideoUpload {
            id: file_id.to_string(),
            media: MediaKind::Video,
            data,
        })?;
        let timeout = response_timeout(payload.len(), &self.transfer);
        let frame = self
            .send_packet_wait_ack(PacketType::Video, &payload, timeout, cancel)
            .await?;
        Self::expect_ack(&frame, |text| acks_file(text, file_id))?;
        info!("Uploaded {} ({} bytes)", file_id, size);
        Ok(())
    }

    /// Upload a large video in acknowledged, adaptively sized chunks.
    ///
    /// Reads exactly `total_size` bytes from `reader`. Chunks are strictly
    /// sequential; any failure fails the whole transfer.
    pub async fn upload_chunked_video<R>(
        &mut self,
        file_id: &str,
        mut reader: R,
        total_size: u64,
        cancel: &CancelToken,
        events: Option<&EventSender>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        info!("Starting chunked upload of {} ({} bytes)", file_id, total_size);
        let start = to_json(&ChunkedVideoStart {
            id: file_id.to_string(),
            media: MediaKind::Video,
            total_size,
        })?;
        let timeout = response_timeout(start.len(), &self.transfer);
        let frame = self
            .send_packet_wait_ack(PacketType::ChunkedVideoStart, &start, timeout, cancel)
            .await?;
        Self::expect_ack(&frame, |text| acks_start(text, file_id))?;

        let mut transfer = ChunkedTransfer::new(file_id, total_size, &self.transfer);
        while !transfer.is_complete() {
            if cancel.is_cancelled() {
                self.conn.disconnect();
                return Err(SyncError::Cancelled);
            }

            let len = transfer.next_chunk_len();
            let data = match read_chunk(&mut reader, len).await {
                Ok(data) => data,
                Err(e) => {
                    self.conn.disconnect();
                    return Err(e);
                }
            };

            let index = transfer.chunk_index;
            let payload = to_json(&ChunkedVideoData {
                id: file_id.to_string(),
                chunk_index: index,
                size: len,
                data,
            })?;
            let timeout = response_timeout(payload.len(), &self.transfer);
            let mark = self.conn.last_flush();
            let queued_at = Instant::now();
            let frame = self
                .send_packet_wait_ack(PacketType::ChunkedVideoData, &payload, timeout, cancel)
                .await?;
            // Measured from the flush that put the chunk on the wire
            let acked_at = Instant::now();
            let left_at = self.conn.last_flush().since(mark).unwrap_or(queued_at);
            let rtt = acked_at.saturating_duration_since(left_at);
            Self::expect_ack(&frame, |text| acks_chunk(text, index))?;

            transfer.record_ack(len, rtt);
            trace!(
                "{}: chunk {} ({} bytes) acked in {}ms, next size {}",
                file_id,
                index,
                len,
                transfer.rtt_ms,
                transfer.chunk_size
            );
            emit(
                events,
                SyncEvent::Progress {
                    file_id: file_id.to_string(),
                    sent: transfer.bytes_sent,
                    total: total_size,
                },
            );
        }

        let complete = to_json(&ChunkedVideoComplete {
            id: file_id.to_string(),
            total_bytes: transfer.bytes_sent,
        })?;
        let timeout = response_timeout(complete.len(), &self.transfer);
        let frame = self
            .send_packet_wait_ack(PacketType::ChunkedVideoComplete, &complete, timeout, cancel)
            .await?;
        Self::expect_ack(&frame, |text| acks_file(text, file_id))?;

        info!(
            "Uploaded {} in {} chunks (final chunk size {} bytes{})",
            file_id,
            transfer.chunk_index,
            transfer.chunk_size,
            if transfer.stabilized { ", stabilized" } else { "" }
        );
        Ok(())
    }
}

/// Read exactly `len` bytes, failing if the stream ends first.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len);
    let n = reader.take(len as u64).read_to_end(&mut data).await?;
    if n < len {
        return Err(SyncError::Asset(format!(
            "asset stream ended early: wanted {} bytes, got {}",
            len, n
        )));
    }
    Ok(data)
}

/// A receiver that fell behind has lost response bytes; the stream can't be
/// resynced, so treat it like a dropped connection.
fn inbound_failure(e: RecvError) -> SyncError {
    if let RecvError::Lagged(n) = e {
        warn!("Inbound stream lagged, {} chunks lost", n);
    }
    SyncError::ConnectionClosed
}

fn status_ok(status: &str) -> bool {
    status.trim().to_ascii_uppercase().starts_with("OK")
}

fn rejected(msg: ServerMessage) -> SyncError {
    warn!("Unexpected response: {:?}", msg);
    let detail = match msg {
        ServerMessage::Ack(text) => format!("ack {:?}", text),
        ServerMessage::MediaCount(n) => format!("media count {}", n),
        ServerMessage::Thumbs(t) => format!("{} thumbnails", t.len()),
        ServerMessage::DeleteAck(status) => format!("delete status {:?}", status),
        ServerMessage::Downloaded(items) => format!("{} downloads", items.len()),
        ServerMessage::Unexpected(t) => format!("unexpected {:?} frame", t),
    };
    SyncError::Rejected(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ok() {
        assert!(status_ok("OK"));
        assert!(status_ok(" ok: deleted 3\n"));
        assert!(!status_ok("ERROR: not found"));
        assert!(!status_ok(""));
    }

    #[tokio::test]
    async fn test_read_chunk_short_stream() {
        let mut data: &[u8] = b"abc";
        assert_eq!(read_chunk(&mut data, 2).await.unwrap(), b"ab");
        assert!(matches!(
            read_chunk(&mut data, 4).await,
            Err(SyncError::Asset(_))
        ));
    }

    #[tokio::test]
    async fn test_lagged_receiver_is_connection_closed() {
        let (tx, mut rx) = broadcast::channel::<Bytes>(1);
        for part in [&b"a"[..], b"b", b"c"] {
            tx.send(Bytes::copy_from_slice(part)).unwrap();
        }
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, RecvError::Lagged(2)));
        assert!(matches!(inbound_failure(err), SyncError::ConnectionClosed));

        drop(tx);
        let _ = rx.recv().await;
        let closed = rx.recv().await.unwrap_err();
        assert!(matches!(inbound_failure(closed), SyncError::ConnectionClosed));
    }
}
