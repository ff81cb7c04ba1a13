//! Discovery browser.
//!
//! Joins the discovery multicast group and listens for announcements from
//! other sessions. Valid announcements are upserted into the peer registry.
//! A separate expiry task removes stale entries.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use uuid::Uuid;
use zerocopy::FromBytes;

use flexmidi_core::wire::{rtp_midi_hash, DiscoveryAnnouncement};

use super::{expire, PeerEntry, PeerRegistry};

/// Listen for announcements and populate `registry` until shutdown.
pub async fn browse_loop(
    socket: std::net::UdpSocket,
    registry: PeerRegistry,
    local_id: Uuid,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;
    let mut buf = vec![0u8; 512];

    tracing::info!(addr = ?socket.local_addr().ok(), "discovery browser starting");

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("discovery browser shutting down");
                return Ok(());
            }
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            }
        };
        handle_announcement(&registry, &buf[..len], src, local_id);
    }
}

/// Parse one datagram and upsert the registry. Returns the peer id if the
/// datagram was a foreign `_rtp-midi._udp` announcement.
pub fn handle_announcement(
    registry: &PeerRegistry,
    data: &[u8],
    src: SocketAddr,
    local_id: Uuid,
) -> Option<Uuid> {
    let Some(announcement) = DiscoveryAnnouncement::read_from(data) else {
        tracing::trace!(len = data.len(), "ignoring malformed announcement");
        return None;
    };
    if announcement.service_hash != rtp_midi_hash() {
        tracing::trace!(service = hex::encode(&announcement.service_hash[..8]), "ignoring foreign service");
        return None;
    }

    let endpoint_id = Uuid::from_bytes(announcement.endpoint_id);
    if endpoint_id == local_id {
        tracing::trace!("ignoring own announcement");
        return None;
    }

    let addr = SocketAddr::new(src.ip(), announcement.session_port.get());
    let name = announcement.instance_name();
    let is_new = !registry.contains_key(&endpoint_id);
    if is_new {
        tracing::debug!(peer = %endpoint_id, name = %name, addr = %addr, "peer discovered");
    }

    registry.insert(
        endpoint_id,
        PeerEntry {
            endpoint_id,
            name,
            addr,
            protocol_version: announcement.protocol_version,
            last_seen: Instant::now(),
        },
    );
    Some(endpoint_id)
}

/// Remove registry entries that have not been refreshed within `ttl`.
pub async fn expiry_loop(
    registry: PeerRegistry,
    ttl: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                let removed = expire(&registry, ttl);
                if removed > 0 {
                    tracing::debug!(removed, "expired peer registry entries");
                }
            }
        }
    }
}

/// Create a UDP socket joined to the discovery multicast group.
pub fn make_listener_socket(group: Ipv4Addr, port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).context("bind()")?;

    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .context("IP_ADD_MEMBERSHIP")?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::new_registry;
    use flexmidi_core::wire::{service_hash, PROTOCOL_VERSION};
    use zerocopy::AsBytes;

    fn src() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], 40000))
    }

    #[test]
    fn announcement_upserts_registry() {
        let registry = new_registry();
        let peer = Uuid::new_v4();
        let ann = DiscoveryAnnouncement::new(*peer.as_bytes(), 5004, PROTOCOL_VERSION, "studio-b");

        let got = handle_announcement(&registry, ann.as_bytes(), src(), Uuid::new_v4());
        assert_eq!(got, Some(peer));

        let entry = registry.get(&peer).unwrap();
        assert_eq!(entry.name, "studio-b");
        assert_eq!(entry.addr, SocketAddr::from(([192, 168, 1, 20], 5004)));
        assert_eq!(entry.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn own_announcement_is_ignored() {
        let registry = new_registry();
        let me = Uuid::new_v4();
        let ann = DiscoveryAnnouncement::new(*me.as_bytes(), 5004, PROTOCOL_VERSION, "me");
        assert!(handle_announcement(&registry, ann.as_bytes(), src(), me).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn foreign_service_and_garbage_are_ignored() {
        let registry = new_registry();
        let mut ann =
            DiscoveryAnnouncement::new(*Uuid::new_v4().as_bytes(), 1, PROTOCOL_VERSION, "x");
        ann.service_hash = service_hash(b"_other._udp");
        assert!(handle_announcement(&registry, ann.as_bytes(), src(), Uuid::new_v4()).is_none());
        assert!(handle_announcement(&registry, b"hello", src(), Uuid::new_v4()).is_none());
        assert!(registry.is_empty());
    }
}
