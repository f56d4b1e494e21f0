// Scripted in-process media server for integration tests
#![allow(dead_code)]

use mediasync::config::{ClientConfig, ConnectionConfig, TransferConfig};
use mediasync::protocol::{encode, Frame, FrameBuffer, PacketType};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the server does with one received frame
pub enum Reply {
    /// Answer with a frame
    Send(PacketType, Vec<u8>),
    /// Answer after a delay
    Delayed(Duration, PacketType, Vec<u8>),
    /// Stay silent
    Nothing,
    /// Drop the connection
    Close,
}

pub fn ack(text: impl Into<String>) -> Reply {
    Reply::Send(PacketType::SyncComplete, text.into().into_bytes())
}

type Script = Arc<dyn Fn(&Frame) -> Reply + Send + Sync>;

pub struct FakeServer {
    pub port: u16,
    received: Arc<Mutex<Vec<Frame>>>,
    accepted: Arc<Mutex<usize>>,
    handle: JoinHandle<()>,
}

impl FakeServer {
    /// Listen on an ephemeral localhost port, answering every frame with `script`.
    ///
    /// Accepts any number of connections, one after another.
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(&Frame) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(Mutex::new(0));
        let script: Script = Arc::new(script);

        let rec = Arc::clone(&received);
        let acc = Arc::clone(&accepted);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                *acc.lock().unwrap() += 1;
                let script = Arc::clone(&script);
                let rec = Arc::clone(&rec);
                tokio::spawn(async move {
                    let mut buffer = FrameBuffer::new();
                    let mut buf = vec![0u8; 64 * 1024];
                    loop {
                        let n = match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buffer.push(&buf[..n]);
                        while let Ok(Some(frame)) = buffer.next_frame() {
                            let reply = script(&frame);
                            rec.lock().unwrap().push(frame);
                            match reply {
                                Reply::Send(t, payload) => {
                                    if sock.write_all(&encode(t, &payload)).await.is_err() {
                                        return;
                                    }
                                }
                                Reply::Delayed(delay, t, payload) => {
                                    tokio::time::sleep(delay).await;
                                    if sock.write_all(&encode(t, &payload)).await.is_err() {
                                        return;
                                    }
                                }
                                Reply::Nothing => {}
                                Reply::Close => return,
                            }
                        }
                    }
                });
            }
        });

        Self {
            port,
            received,
            accepted,
            handle,
        }
    }

    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().unwrap().clone()
    }

    pub fn accepted(&self) -> usize {
        *self.accepted.lock().unwrap()
    }

    /// Wait until at least `n` frames have arrived.
    pub async fn wait_for_frames(&self, n: usize) -> Vec<Frame> {
        for _ in 0..200 {
            let frames = self.received();
            if frames.len() >= n {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} frames, got {}", n, self.received().len());
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Config with short pauses so tests don't wait on pacing
pub fn fast_config(port: u16) -> ClientConfig {
    ClientConfig {
        device_name: "test-device".to_string(),
        server_port: port,
        ledger_path: None,
        connection: ConnectionConfig {
            drain_pause_ms: 0,
            drain_pause_full_ms: 0,
            backpressure_poll_ms: 5,
            reconnect_cooldown_ms: 10,
            force_reconnect_cooldown_ms: 10,
            ..Default::default()
        },
        transfer: TransferConfig {
            poll_interval_ms: 20,
            piece_pause_ms: 1,
            ..Default::default()
        },
        discovery: Default::default(),
    }
}

/// JSON body of a frame
pub fn json(frame: &Frame) -> serde_json::Value {
    serde_json::from_slice(&frame.payload).unwrap()
}
