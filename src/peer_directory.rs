//! The peer directory (C2): the set of peers this swarm currently knows
//! about, refreshed periodically from the tracker and pruned of peers that
//! haven't been reconfirmed in a while.
//!
//! Readers (the scheduler, the choke controller) take an `Arc` snapshot of
//! the whole directory rather than locking per-peer state, so a scheduling
//! pass never blocks on, or is blocked by, a tracker refresh landing midway
//! through it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::PeerId;

/// What's known locally about one peer in the swarm.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    /// When the tracker last reconfirmed this peer is part of the swarm.
    pub last_seen: Instant,
}

/// An immutable point-in-time view of the known peer set.
///
/// `Arc<PeerSnapshot>` is cheap to clone and hand to a scheduling pass; the
/// directory publishes a fresh one by replacement rather than mutating the
/// one readers are holding.
#[derive(Debug, Default)]
pub struct PeerSnapshot {
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerSnapshot {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }
}

/// The peer directory itself: a snapshot behind a lock, replaced wholesale
/// on every refresh or mutation.
pub struct PeerDirectory {
    peer_timeout: Duration,
    snapshot: RwLock<Arc<PeerSnapshot>>,
}

impl PeerDirectory {
    pub fn new(peer_timeout: Duration) -> Self {
        Self {
            peer_timeout,
            snapshot: RwLock::new(Arc::new(PeerSnapshot::default())),
        }
    }

    /// Returns the current snapshot without blocking on any in-flight
    /// refresh (readers only ever see a complete, consistent snapshot).
    pub async fn snapshot(&self) -> Arc<PeerSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Adds or refreshes a single peer's `last_seen` timestamp, e.g. after a
    /// successful inbound or outbound handshake with it.
    ///
    /// The tracker's peer list is advisory: a peer the tracker doesn't know
    /// about yet but that connects to us directly is still tracked here.
    pub async fn upsert(&self, peer_id: PeerId, addr: SocketAddr) {
        let mut guard = self.snapshot.write().await;
        let mut peers = guard.peers.clone();
        peers.insert(
            peer_id,
            PeerEntry {
                peer_id,
                addr,
                last_seen: Instant::now(),
            },
        );
        *guard = Arc::new(PeerSnapshot { peers });
    }

    /// Replaces the directory's contents with the tracker's current peer
    /// list, preserving `last_seen` for peers already known (so a peer we
    /// handshaked with directly isn't immediately timed out just because the
    /// tracker independently reports it too) and initializing new peers to
    /// "seen now".
    pub async fn refresh_from_tracker(&self, peers: Vec<(PeerId, SocketAddr)>) {
        let mut guard = self.snapshot.write().await;
        let now = Instant::now();
        let mut next = HashMap::with_capacity(peers.len());
        for (peer_id, addr) in peers {
            let last_seen = guard
                .peers
                .get(&peer_id)
                .map(|entry| entry.last_seen)
                .unwrap_or(now);
            next.insert(
                peer_id,
                PeerEntry {
                    peer_id,
                    addr,
                    last_seen,
                },
            );
        }
        *guard = Arc::new(PeerSnapshot { peers: next });
    }

    /// Drops a peer immediately, e.g. because its connection failed.
    pub async fn remove(&self, peer_id: &PeerId) {
        let mut guard = self.snapshot.write().await;
        if !guard.peers.contains_key(peer_id) {
            return;
        }
        let mut peers = guard.peers.clone();
        peers.remove(peer_id);
        *guard = Arc::new(PeerSnapshot { peers });
    }

    /// Drops every peer not reconfirmed within `peer_timeout`. Called on the
    /// same cadence as the tracker refresh.
    pub async fn evict_stale(&self) {
        let mut guard = self.snapshot.write().await;
        let timeout = self.peer_timeout;
        let now = Instant::now();
        let before = guard.peers.len();
        let peers: HashMap<_, _> = guard
            .peers
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) < timeout)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        if peers.len() != before {
            *guard = Arc::new(PeerSnapshot { peers });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(byte: u8) -> PeerId {
        [byte; 20]
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[tokio::test]
    async fn upsert_then_snapshot_sees_the_peer() {
        let dir = PeerDirectory::new(Duration::from_secs(40));
        dir.upsert(peer_id(1), addr()).await;
        let snapshot = dir.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&peer_id(1)).is_some());
    }

    #[tokio::test]
    async fn refresh_preserves_last_seen_for_known_peers() {
        let dir = PeerDirectory::new(Duration::from_secs(40));
        dir.upsert(peer_id(1), addr()).await;
        let first_seen = dir.snapshot().await.get(&peer_id(1)).unwrap().last_seen;

        dir.refresh_from_tracker(vec![(peer_id(1), addr()), (peer_id(2), addr())])
            .await;
        let snapshot = dir.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&peer_id(1)).unwrap().last_seen, first_seen);
    }

    #[tokio::test]
    async fn remove_drops_a_single_peer() {
        let dir = PeerDirectory::new(Duration::from_secs(40));
        dir.upsert(peer_id(1), addr()).await;
        dir.upsert(peer_id(2), addr()).await;
        dir.remove(&peer_id(1)).await;
        let snapshot = dir.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&peer_id(2)).is_some());
    }

    #[tokio::test]
    async fn evict_stale_drops_peers_past_the_timeout() {
        let dir = PeerDirectory::new(Duration::from_millis(1));
        dir.upsert(peer_id(1), addr()).await;
        tokio::time::delay_for(Duration::from_millis(5)).await;
        dir.evict_stale().await;
        assert!(dir.snapshot().await.is_empty());
    }
}
