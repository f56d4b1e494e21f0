//! LAN server discovery over UDP broadcast.
//!
//! The client broadcasts a fixed query to the subnet and collects replies of
//! the form `photo_server:<name>,IP:<ip>` for a fixed window.

use crate::cancel::CancelToken;
use crate::config::DiscoveryConfig;
use crate::error::{Result, SyncError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DISCOVERY_QUERY: &str = "who is photo server?";

const REPLY_PREFIX: &str = "photo_server:";
const IP_MARKER: &str = ",IP:";
const MAX_REPLY: usize = 1024;

/// A server that answered discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub name: String,
    pub ip_address: IpAddr,
}

/// Parse `photo_server:<name>,IP:<ip>`.
pub fn parse_reply(reply: &str) -> Option<DeviceInfo> {
    let body = reply.trim().strip_prefix(REPLY_PREFIX)?;
    let (name, ip) = body.rsplit_once(IP_MARKER)?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(DeviceInfo {
        name: name.to_string(),
        ip_address: ip.trim().parse().ok()?,
    })
}

/// Directed broadcast address: host bits of `ip` all set.
pub fn broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let ip = u32::from(ip);
    let mask = u32::from(mask);
    Ipv4Addr::from((ip & mask) | !mask)
}

/// IPv4 address of the interface holding the default route.
///
/// Connecting a UDP socket sends nothing; it only selects a source address.
pub async fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

async fn query_target(config: &DiscoveryConfig) -> Ipv4Addr {
    if let Some(target) = config.target_override {
        return target;
    }
    let local = match config.local_ip {
        Some(ip) => Some(ip),
        None => local_ipv4().await,
    };
    match local {
        Some(ip) => broadcast_address(ip, config.subnet_mask),
        None => {
            warn!("Cannot determine local address, using limited broadcast");
            Ipv4Addr::BROADCAST
        }
    }
}

/// Broadcast the query and stream replies as they arrive.
///
/// The receiver closes when the window ends or `cancel` fires. Replies are not
/// deduplicated.
pub async fn discover_stream(
    config: &DiscoveryConfig,
    cancel: CancelToken,
) -> Result<mpsc::Receiver<DeviceInfo>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    let target = SocketAddr::from((query_target(config).await, config.port));
    if let Err(e) = socket.send_to(DISCOVERY_QUERY.as_bytes(), target).await {
        warn!("Discovery query to {} failed: {}", target, e);
        return Err(SyncError::Io(e));
    }
    info!("Sent discovery query to {}", target);

    let (tx, rx) = mpsc::channel(32);
    let deadline = Instant::now() + config.window();
    let poll = std::time::Duration::from_millis(100);

    tokio::spawn(async move {
        let mut buf = [0u8; MAX_REPLY];
        let mut tick = interval(poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((len, from)) => {
                        let text = String::from_utf8_lossy(&buf[..len]);
                        match parse_reply(&text) {
                            Some(device) => {
                                debug!("Discovery reply from {}: {:?}", from, device);
                                if tx.send(device).await.is_err() {
                                    break;
                                }
                            }
                            None => warn!("Ignoring malformed discovery reply from {}: {:?}", from, text),
                        }
                    }
                    Err(e) => {
                        warn!("Discovery receive failed: {}", e);
                        break;
                    }
                },
                _ = tick.tick() => {
                    if cancel.is_cancelled() {
                        debug!("Discovery cancelled");
                        break;
                    }
                }
                _ = sleep_until(deadline) => break,
            }
        }
    });

    Ok(rx)
}

/// Collect every reply received during the window.
pub async fn discover(config: &DiscoveryConfig, cancel: CancelToken) -> Result<Vec<DeviceInfo>> {
    let mut rx = discover_stream(config, cancel).await?;
    let mut devices = Vec::new();
    while let Some(device) = rx.recv().await {
        devices.push(device);
    }
    info!("Discovery found {} replies", devices.len());
    Ok(devices)
}

/// Drop repeated replies, keeping first-seen order.
pub fn dedup_devices(devices: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    let mut seen = std::collections::HashSet::new();
    devices
        .into_iter()
        .filter(|d| seen.insert(d.clone()))
        .collect()
}
