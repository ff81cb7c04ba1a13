//! Discovery announcement broadcast.
//!
//! Periodically multicasts this session's DiscoveryAnnouncement so nearby
//! browsers learn its endpoint id and data port.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::broadcast;
use tokio::time;
use zerocopy::AsBytes;

use flexmidi_core::wire::DiscoveryAnnouncement;

/// Broadcast `announcement` every `interval` until shutdown.
pub async fn advertise_loop(
    announcement: DiscoveryAnnouncement,
    dest: SocketAddrV4,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = make_multicast_socket().context("failed to create multicast advertise socket")?;
    let socket = tokio::net::UdpSocket::from_std(socket.into())
        .context("failed to convert to tokio UdpSocket")?;

    let mut ticker = time::interval(interval);

    tracing::info!(
        dest = %dest,
        name = %announcement.instance_name(),
        port = announcement.session_port.get(),
        interval_ms = interval.as_millis() as u64,
        "discovery advertiser starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("discovery advertiser shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                match socket.send_to(announcement.as_bytes(), dest).await {
                    Ok(n) => tracing::trace!(bytes = n, "announcement sent"),
                    Err(e) => tracing::warn!(error = %e, "announcement send failed"),
                }
            }
        }
    }
}

/// Create a UDP socket suitable for sending IPv4 multicast.
fn make_multicast_socket() -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    // TTL 1: stay on the local link
    socket.set_multicast_ttl_v4(1).context("IP_MULTICAST_TTL")?;
    // Sessions on the same host must see each other
    socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
        .context("bind()")?;

    Ok(socket)
}
