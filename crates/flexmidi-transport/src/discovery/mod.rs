//! Peer discovery: tracks nearby sessions advertising `_rtp-midi._udp`.
//!
//! The registry is a concurrent map from endpoint id to PeerEntry,
//! populated by the multicast browser and read by the session when it
//! needs a peer address. Entries expire after the peer TTL if not refreshed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

pub mod advertiser;
pub mod browser;

/// A session seen in a discovery announcement.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub endpoint_id: Uuid,
    /// Instance name from the announcement.
    pub name: String,
    /// Announcement source address with the advertised session port.
    pub addr: SocketAddr,
    pub protocol_version: u8,
    /// When this entry was last refreshed. Used for TTL expiry.
    pub last_seen: Instant,
}

/// Shared between the browser, the expiry loop and the session.
pub type PeerRegistry = Arc<DashMap<Uuid, PeerEntry>>;

pub fn new_registry() -> PeerRegistry {
    Arc::new(DashMap::new())
}

/// Most recently seen peer other than `local_id`.
pub fn freshest_peer(registry: &PeerRegistry, local_id: Uuid) -> Option<PeerEntry> {
    registry
        .iter()
        .filter(|e| *e.key() != local_id)
        .max_by_key(|e| e.value().last_seen)
        .map(|e| e.value().clone())
}

/// Drop entries not refreshed within `ttl`. Returns the number removed.
pub fn expire(registry: &PeerRegistry, ttl: Duration) -> usize {
    let before = registry.len();
    registry.retain(|_, entry| entry.last_seen.elapsed() < ttl);
    before - registry.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: Uuid, port: u16, last_seen: Instant) -> PeerEntry {
        PeerEntry {
            endpoint_id: id,
            name: format!("peer-{port}"),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            protocol_version: 1,
            last_seen,
        }
    }

    #[test]
    fn freshest_peer_skips_self() {
        let registry = new_registry();
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let now = Instant::now();
        registry.insert(me, entry(me, 1, now));
        assert!(freshest_peer(&registry, me).is_none());

        registry.insert(other, entry(other, 2, now));
        assert_eq!(freshest_peer(&registry, me).unwrap().endpoint_id, other);
    }

    #[test]
    fn expire_removes_stale_entries() {
        let registry = new_registry();
        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let now = Instant::now();
        registry.insert(fresh, entry(fresh, 1, now));
        registry.insert(
            stale,
            entry(stale, 2, now.checked_sub(Duration::from_secs(30)).unwrap_or(now)),
        );

        let removed = expire(&registry, Duration::from_secs(10));
        assert_eq!(removed, 1);
        assert!(registry.contains_key(&fresh));
    }
}
