//! Socket tuning for lossy mobile uplinks.

use crate::config::ConnectionConfig;
use crate::error::Result;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;

/// Keepalive, Nagle on, abortive close.
///
/// Nagle stays enabled so small writes coalesce on slow links. Linger is zero
/// so dropping the socket resets it instead of waiting out unsent data.
pub fn tune(stream: &TcpStream, config: &ConnectionConfig) -> Result<()> {
    stream.set_nodelay(false)?;

    let sock = SockRef::from(stream);
    let keepalive = keepalive_params(config.keepalive());
    sock.set_tcp_keepalive(&keepalive)?;
    sock.set_linger(Some(Duration::ZERO))?;

    tracing::trace!(
        "Tuned socket: keepalive={:?} nodelay=false linger=0",
        config.keepalive()
    );
    Ok(())
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "windows"
))]
fn keepalive_params(interval: Duration) -> TcpKeepalive {
    TcpKeepalive::new().with_time(interval).with_interval(interval)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "windows"
)))]
fn keepalive_params(interval: Duration) -> TcpKeepalive {
    TcpKeepalive::new().with_time(interval)
}
