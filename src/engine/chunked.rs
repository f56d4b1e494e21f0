//! Adaptive chunk sizing for large uploads.
//!
//! Chunks start small and grow by a fixed step after every acknowledged chunk
//! whose round trip beat the target. The first chunk that meets or exceeds the
//! target freezes the size for the rest of the transfer.

use crate::config::TransferConfig;
use std::time::Duration;

/// State of one chunked upload. Discarded when the transfer ends.
#[derive(Debug, Clone)]
pub struct ChunkedTransfer {
    pub file_id: String,
    pub total_size: u64,
    pub chunk_size: usize,
    /// Index of the next chunk to send
    pub chunk_index: u32,
    /// Round trip of the last acknowledged chunk
    pub rtt_ms: u64,
    pub stabilized: bool,
    pub bytes_sent: u64,
    step: usize,
    target_rtt: Duration,
}

impl ChunkedTransfer {
    pub fn new(file_id: impl Into<String>, total_size: u64, config: &TransferConfig) -> Self {
        Self {
            file_id: file_id.into(),
            total_size,
            chunk_size: config.initial_chunk_size.max(1),
            chunk_index: 0,
            rtt_ms: 0,
            stabilized: false,
            bytes_sent: 0,
            step: config.chunk_step,
            target_rtt: config.target_rtt(),
        }
    }

    /// Length of the next chunk (the last one may be short).
    pub fn next_chunk_len(&self) -> usize {
        let remaining = self.total_size.saturating_sub(self.bytes_sent);
        remaining.min(self.chunk_size as u64) as usize
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.total_size
    }

    /// Record an acknowledged chunk and adapt the size.
    pub fn record_ack(&mut self, sent: usize, rtt: Duration) {
        self.bytes_sent += sent as u64;
        self.chunk_index += 1;
        self.rtt_ms = rtt.as_millis() as u64;

        if self.stabilized {
            return;
        }
        if rtt < self.target_rtt {
            self.chunk_size += self.step;
        } else {
            self.stabilized = true;
            tracing::debug!(
                "{}: chunk size stabilized at {} bytes (rtt {}ms)",
                self.file_id,
                self.chunk_size,
                self.rtt_ms
            );
        }
    }
}
