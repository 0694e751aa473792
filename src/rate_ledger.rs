//! The rate ledger (C3): rolling upload/download throughput per peer, used
//! by the scheduler to pick providers and by the choke controller to rank
//! reciprocity.
//!
//! Rather than keep a growing list of transfer events and filter it on every
//! read, each peer/direction keeps a small ring buffer (capped at
//! [`RING_CAPACITY`] entries) that's pruned lazily against the configured
//! window on access. Either bound -- count or age -- is enough to keep
//! memory flat regardless of transfer volume.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::PeerId;

/// Entries older than this are dropped from a peer's ring, in addition to
/// the hard count cap; see [`RateLedger::record`].
const RING_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

#[derive(Debug, Default)]
struct Direction {
    samples: VecDeque<Sample>,
}

impl Direction {
    fn record(&mut self, bytes: u64, window: Duration) {
        let now = Instant::now();
        self.samples.push_back(Sample { at: now, bytes });
        while self.samples.len() > RING_CAPACITY {
            self.samples.pop_front();
        }
        self.prune(now, window);
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second averaged over whatever of the window has actually
    /// elapsed since the oldest surviving sample.
    fn rate(&self, window: Duration) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|s| s.bytes).sum();
        let now = Instant::now();
        let oldest = self.samples.front().unwrap().at;
        let elapsed = now.duration_since(oldest).min(window);
        let elapsed_secs = elapsed.as_secs_f64().max(1.0);
        total as f64 / elapsed_secs
    }
}

#[derive(Debug, Default)]
struct PeerRates {
    down: Direction,
    up: Direction,
}

/// Tracks rolling upload and download rates per peer.
pub struct RateLedger {
    window: Duration,
    peers: RwLock<HashMap<PeerId, PeerRates>>,
}

impl RateLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Records that `bytes` were received from `peer_id` just now.
    pub async fn record_down(&self, peer_id: PeerId, bytes: u64) {
        let mut peers = self.peers.write().await;
        peers
            .entry(peer_id)
            .or_default()
            .down
            .record(bytes, self.window);
    }

    /// Records that `bytes` were sent to `peer_id` just now.
    pub async fn record_up(&self, peer_id: PeerId, bytes: u64) {
        let mut peers = self.peers.write().await;
        peers
            .entry(peer_id)
            .or_default()
            .up
            .record(bytes, self.window);
    }

    /// The peer's download rate (bytes/sec we're receiving from it) over the
    /// configured rolling window. `0.0` for an unknown or idle peer.
    pub async fn down_rate(&self, peer_id: &PeerId) -> f64 {
        let peers = self.peers.read().await;
        peers.get(peer_id).map(|p| p.down.rate(self.window)).unwrap_or(0.0)
    }

    /// The peer's upload rate (bytes/sec we're sending to it) over the
    /// configured rolling window. `0.0` for an unknown or idle peer.
    pub async fn up_rate(&self, peer_id: &PeerId) -> f64 {
        let peers = self.peers.read().await;
        peers.get(peer_id).map(|p| p.up.rate(self.window)).unwrap_or(0.0)
    }

    /// Returns every peer id currently carrying rate history and its
    /// download rate, used by the choke controller's regular unchoke tick to
    /// rank candidates.
    pub async fn down_rates(&self) -> Vec<(PeerId, f64)> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .map(|(id, rates)| (*id, rates.down.rate(self.window)))
            .collect()
    }

    /// Drops a peer's history entirely, e.g. once its connection closes.
    pub async fn forget(&self, peer_id: &PeerId) {
        self.peers.write().await.remove(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(byte: u8) -> PeerId {
        [byte; 20]
    }

    #[tokio::test]
    async fn unknown_peer_has_zero_rate() {
        let ledger = RateLedger::new(Duration::from_secs(30));
        assert_eq!(ledger.down_rate(&peer_id(1)).await, 0.0);
    }

    #[tokio::test]
    async fn recording_down_bytes_increases_down_rate_only() {
        let ledger = RateLedger::new(Duration::from_secs(30));
        ledger.record_down(peer_id(1), 16384).await;
        assert!(ledger.down_rate(&peer_id(1)).await > 0.0);
        assert_eq!(ledger.up_rate(&peer_id(1)).await, 0.0);
    }

    #[tokio::test]
    async fn ring_buffer_is_capped_at_ten_entries() {
        let ledger = RateLedger::new(Duration::from_secs(30));
        for _ in 0..25 {
            ledger.record_down(peer_id(1), 1024).await;
        }
        let mut peers = ledger.peers.write().await;
        let entry = peers.get_mut(&peer_id(1)).unwrap();
        assert!(entry.down.samples.len() <= RING_CAPACITY);
    }

    #[tokio::test]
    async fn forget_removes_all_history() {
        let ledger = RateLedger::new(Duration::from_secs(30));
        ledger.record_down(peer_id(1), 1024).await;
        ledger.forget(&peer_id(1)).await;
        assert_eq!(ledger.down_rate(&peer_id(1)).await, 0.0);
    }

    #[tokio::test]
    async fn down_rates_lists_every_known_peer() {
        let ledger = RateLedger::new(Duration::from_secs(30));
        ledger.record_down(peer_id(1), 1024).await;
        ledger.record_down(peer_id(2), 2048).await;
        let rates = ledger.down_rates().await;
        assert_eq!(rates.len(), 2);
    }
}
