mod common;

#[cfg(test)]
mod tests {
    use super::common::{fast_config, FakeServer, Reply};
    use bytes::Bytes;
    use mediasync::config::ConnectionConfig;
    use mediasync::protocol::PacketType;
    use mediasync::{CancelToken, Connection, SyncClient, SyncError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accept one connection and discard everything it sends
    async fn sink() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            while let Ok(n) = sock.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_queue_never_exceeds_capacity() {
        let port = sink().await;
        let config = ConnectionConfig {
            queue_capacity: 10,
            drain_batch: 3,
            drain_pause_ms: 2_000,
            drain_pause_full_ms: 2_000,
            backpressure_poll_ms: 10,
            ..Default::default()
        };
        let conn = Arc::new(Connection::connect("127.0.0.1", port, config).await.unwrap());
        let sent = Arc::new(AtomicUsize::new(0));

        let producer = {
            let conn = Arc::clone(&conn);
            let sent = Arc::clone(&sent);
            tokio::spawn(async move {
                for _ in 0..20 {
                    conn.send_data(Bytes::from_static(b"payload")).await.unwrap();
                    sent.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(conn.queued_len() <= 10);
        }

        // One batch (up to 3) went out before the drain task paused; the rest
        // fill the queue and the producer blocks
        assert_eq!(conn.queued_len(), 10);
        let sent = sent.load(Ordering::SeqCst);
        assert!((11..=13).contains(&sent), "sent {}", sent);
        assert!(!producer.is_finished());
        producer.abort();
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let res = Connection::connect("127.0.0.1", port, ConnectionConfig::default()).await;
        assert!(matches!(res, Err(SyncError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_peer_eof_marks_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = Connection::connect("127.0.0.1", port, ConnectionConfig::default())
            .await
            .unwrap();
        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);

        for _ in 0..100 {
            if conn.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send_data(Bytes::from_static(b"x")).await,
            Err(SyncError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_force_reconnect_after_failure() -> anyhow::Result<()> {
        let server = FakeServer::start(|_| {
            Reply::Send(PacketType::MediaCountResponse, vec![0, 0, 0, 9])
        })
        .await;
        let mut client = SyncClient::connect("127.0.0.1", &fast_config(server.port)).await?;
        let cancel = CancelToken::new();

        client.disconnect();
        assert!(!client.is_connected());
        assert!(matches!(
            client.get_media_count(&cancel).await,
            Err(SyncError::ConnectionClosed)
        ));

        client.force_reconnect().await?;
        assert!(client.is_connected());
        assert_eq!(client.get_media_count(&cancel).await?, 9);
        assert_eq!(server.accepted(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconnect_uses_same_address() -> anyhow::Result<()> {
        let server = FakeServer::start(|_| Reply::Nothing).await;
        let mut client = SyncClient::connect("127.0.0.1", &fast_config(server.port)).await?;

        client.reconnect().await?;
        assert_eq!(client.connection().peer(), ("127.0.0.1", server.port));
        assert!(client.is_connected());
        Ok(())
    }
}
