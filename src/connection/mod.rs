//! Flow-controlled TCP connection.
//!
//! ```text
//!  send_data() --> [bounded queue] --> drain task --> socket
//!                                                       |
//!  subscribe() <-- [broadcast channel] <-- read task <--+
//! ```
//!
//! The outbound queue holds at most `queue_capacity` chunks. Producers block
//! (polling) while it is full, so a slow uplink never grows the OS send buffer
//! without bound. The drain task writes a few chunks at a time, flushes, then
//! pauses so the path can catch up.
//!
//! Every completed flush is stamped (`last_flush`), so callers can time a
//! response from when their bytes actually left rather than from when they
//! were queued.
//!
//! Any read or write error marks the connection closed. Nothing here retries.

mod socket;

use crate::config::ConnectionConfig;
use crate::error::{Result, SyncError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// Read buffer size for the inbound task
const READ_BUF_SIZE: usize = 64 * 1024;

/// Count and time of the drain task's completed flushes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushMark {
    pub count: u64,
    pub at: Option<Instant>,
}

impl FlushMark {
    /// Time of the latest flush, if one happened after `earlier` was taken.
    pub fn since(&self, earlier: FlushMark) -> Option<Instant> {
        if self.count > earlier.count {
            self.at
        } else {
            None
        }
    }
}

/// State shared between the connection handle and its background tasks
struct Shared {
    closed: AtomicBool,
    queue: Mutex<VecDeque<Bytes>>,
    queued: Notify,
    /// Chunks taken off the queue but not yet flushed
    in_flight: AtomicUsize,
    flushed: Mutex<FlushMark>,
}

impl Shared {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queued: Notify::new(),
            in_flight: AtomicUsize::new(0),
            flushed: Mutex::new(FlushMark::default()),
        }
    }

    fn lock_flushed(&self) -> MutexGuard<'_, FlushMark> {
        self.flushed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_flushed(&self) {
        let mut mark = self.lock_flushed();
        mark.count += 1;
        mark.at = Some(Instant::now());
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Wake the drain task so it can exit
        self.queued.notify_one();
    }

    fn take_batch(&self, max: usize) -> Vec<Bytes> {
        let mut queue = self.lock_queue();
        let n = queue.len().min(max);
        let batch: Vec<Bytes> = queue.drain(..n).collect();
        self.in_flight.store(batch.len(), Ordering::SeqCst);
        batch
    }
}

/// A live (or closed) connection to one server
pub struct Connection {
    host: String,
    port: u16,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    inbound: broadcast::Sender<Bytes>,
    reader: Option<JoinHandle<()>>,
    drainer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Open a socket to `host:port` and start the background tasks.
    pub async fn connect(host: &str, port: u16, config: ConnectionConfig) -> Result<Self> {
        let mut conn = Self {
            host: host.to_string(),
            port,
            config,
            shared: Arc::new(Shared::new()),
            inbound: broadcast::channel(1).0,
            reader: None,
            drainer: None,
        };
        conn.open().await?;
        Ok(conn)
    }

    async fn open(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = match timeout(self.config.connect_timeout(), TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(SyncError::Unreachable { addr, source }),
            Err(_) => {
                return Err(SyncError::Unreachable {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        socket::tune(&stream, &self.config)?;

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared::new());
        let (inbound, _) = broadcast::channel(self.config.inbound_capacity.max(1));

        self.reader = Some(tokio::spawn(read_loop(
            read_half,
            Arc::clone(&shared),
            inbound.clone(),
        )));
        self.drainer = Some(tokio::spawn(drain_loop(
            write_half,
            Arc::clone(&shared),
            self.config.clone(),
        )));
        self.shared = shared;
        self.inbound = inbound;

        info!("Connected to {}", addr);
        Ok(())
    }

    /// Queue `data` for sending.
    ///
    /// Blocks (polling) while the queue is at capacity. Fails once the
    /// connection is closed.
    pub async fn send_data(&self, data: Bytes) -> Result<()> {
        loop {
            if self.shared.is_closed() {
                return Err(SyncError::ConnectionClosed);
            }
            {
                let mut queue = self.shared.lock_queue();
                if queue.len() < self.config.queue_capacity {
                    trace!("Queued {} bytes ({} pending)", data.len(), queue.len() + 1);
                    queue.push_back(data);
                    drop(queue);
                    self.shared.queued.notify_one();
                    return Ok(());
                }
            }
            trace!("Send queue full, waiting");
            sleep(self.config.backpressure_poll()).await;
        }
    }

    /// Wait until everything queued so far has been written and flushed.
    pub async fn wait_drained(&self) -> Result<()> {
        loop {
            if self.shared.is_closed() {
                return Err(SyncError::ConnectionClosed);
            }
            let idle = self.shared.lock_queue().is_empty()
                && self.shared.in_flight.load(Ordering::SeqCst) == 0;
            if idle {
                return Ok(());
            }
            sleep(self.config.backpressure_poll()).await;
        }
    }

    /// New receiver for inbound byte chunks.
    ///
    /// Only chunks read after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inbound.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Chunks waiting in the outbound queue
    pub fn queued_len(&self) -> usize {
        self.shared.lock_queue().len()
    }

    pub fn last_flush(&self) -> FlushMark {
        *self.shared.lock_flushed()
    }

    pub fn peer(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Tear the socket down immediately. Pending data is discarded.
    pub fn disconnect(&mut self) {
        if !self.shared.is_closed() {
            debug!("Disconnecting from {}:{}", self.host, self.port);
        }
        self.shared.mark_closed();
        self.shared.lock_queue().clear();
        self.shared.in_flight.store(0, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        if let Some(handle) = self.drainer.take() {
            handle.abort();
        }
    }

    /// Disconnect, wait out the cooldown, connect again.
    pub async fn reconnect(&mut self) -> Result<()> {
        let cooldown = self.config.reconnect_cooldown();
        self.reopen(cooldown).await
    }

    /// Like `reconnect`, with the longer cooldown used after hard failures.
    pub async fn force_reconnect(&mut self) -> Result<()> {
        let cooldown = self.config.force_reconnect_cooldown();
        self.reopen(cooldown).await
    }

    async fn reopen(&mut self, cooldown: std::time::Duration) -> Result<()> {
        self.disconnect();
        debug!("Reconnecting to {}:{} after {:?}", self.host, self.port, cooldown);
        sleep(cooldown).await;
        self.open().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    inbound: broadcast::Sender<Bytes>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Peer closed the connection");
                break;
            }
            Ok(n) => {
                trace!("Read {} bytes", n);
                // No subscriber means nobody is waiting on a response; drop it
                let _ = inbound.send(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                warn!("Socket read failed: {}", e);
                break;
            }
        }
    }
    shared.mark_closed();
}

async fn drain_loop(mut writer: OwnedWriteHalf, shared: Arc<Shared>, config: ConnectionConfig) {
    let batch_size = config.drain_batch.max(1);
    loop {
        let batch = shared.take_batch(batch_size);
        if batch.is_empty() {
            if shared.is_closed() {
                break;
            }
            shared.queued.notified().await;
            continue;
        }

        let full = batch.len() == batch_size;
        for chunk in &batch {
            if let Err(e) = writer.write_all(chunk).await {
                error!("Socket write failed: {}", e);
                shared.mark_closed();
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            error!("Socket flush failed: {}", e);
            shared.mark_closed();
            return;
        }
        shared.mark_flushed();
        shared.in_flight.store(0, Ordering::SeqCst);

        let pause = if full {
            config.drain_pause_full()
        } else {
            config.drain_pause()
        };
        sleep(pause).await;
    }
}
