//! The rarest-first scheduler (C4): decides which missing blocks to request
//! next, and from which peer, given each peer's advertised availability.
//!
//! This module is deliberately pure: it takes availability, rate, and
//! success-ratio snapshots as plain arguments and returns a request plan,
//! rather than reaching into the block store, rate ledger, or peer
//! directory itself. The caller (the swarm's download loop) is responsible
//! for gathering those snapshots and for not re-requesting a block that's
//! already in flight.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::conf::SchedulerConf;
use crate::{BlockIndex, PeerId};

/// Per-peer request outcome history, used to deprioritize unreliable
/// providers without permanently blacklisting them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerSuccess {
    pub completed: u64,
    pub failed: u64,
}

impl PeerSuccess {
    fn ratio(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            1.0
        } else {
            self.completed as f64 / total as f64
        }
    }

    fn has_enough_data(&self, min_requests: usize) -> bool {
        (self.completed + self.failed) as usize >= min_requests
    }
}

/// A request assignment: fetch `block` from `peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub block: BlockIndex,
    pub peer: PeerId,
}

/// The rarest-first scheduler.
pub struct Scheduler {
    conf: SchedulerConf,
}

impl Scheduler {
    pub fn new(conf: SchedulerConf) -> Self {
        Self { conf }
    }

    /// Produces up to `batch_size` block assignments, rarest blocks first.
    ///
    /// - `missing` is this peer's currently unowned and not-yet-in-flight
    ///   block indices.
    /// - `availability` maps each block index to the peers known to have
    ///   it, as derived from their advertised bitfields.
    /// - `down_rates` is each peer's current download rate (bytes/sec we
    ///   receive from them), from the rate ledger.
    /// - `success` is each peer's completed/failed request history.
    ///
    /// Blocks no known peer has are skipped: there is nothing to schedule
    /// for them yet. Ties in rarity are broken randomly rather than by
    /// index, so a swarm-wide preference for low indices never emerges.
    pub fn plan(
        &self,
        missing: &[BlockIndex],
        availability: &HashMap<BlockIndex, Vec<PeerId>>,
        down_rates: &HashMap<PeerId, f64>,
        success: &HashMap<PeerId, PeerSuccess>,
    ) -> Vec<Assignment> {
        let mut rng = rand::thread_rng();

        let mut candidates: Vec<(BlockIndex, usize)> = missing
            .iter()
            .filter_map(|&block| {
                let rarity = availability.get(&block).map(Vec::len).unwrap_or(0);
                if rarity == 0 {
                    None
                } else {
                    Some((block, rarity))
                }
            })
            .collect();

        candidates.shuffle(&mut rng);
        candidates.sort_by_key(|&(_, rarity)| rarity);
        candidates.truncate(self.conf.batch_size);

        candidates
            .into_iter()
            .filter_map(|(block, _)| {
                let peers = availability.get(&block)?;
                let peer = self.pick_provider(peers, down_rates, success, &mut rng)?;
                Some(Assignment { block, peer })
            })
            .collect()
    }

    /// Chooses which of a block's known holders to request it from: highest
    /// download rate first, peers with a poor success ratio (given enough
    /// history to judge one) pushed behind peers without that history, and
    /// random tie-breaking among equals.
    fn pick_provider(
        &self,
        peers: &[PeerId],
        down_rates: &HashMap<PeerId, f64>,
        success: &HashMap<PeerId, PeerSuccess>,
        rng: &mut impl rand::Rng,
    ) -> Option<PeerId> {
        let mut ranked: Vec<PeerId> = peers.to_vec();
        ranked.shuffle(rng);
        ranked.sort_by(|a, b| {
            let deprioritized_a = self.is_deprioritized(a, success);
            let deprioritized_b = self.is_deprioritized(b, success);
            if deprioritized_a != deprioritized_b {
                return deprioritized_a.cmp(&deprioritized_b);
            }
            let rate_a = down_rates.get(a).copied().unwrap_or(0.0);
            let rate_b = down_rates.get(b).copied().unwrap_or(0.0);
            rate_b
                .partial_cmp(&rate_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.into_iter().next()
    }

    fn is_deprioritized(&self, peer: &PeerId, success: &HashMap<PeerId, PeerSuccess>) -> bool {
        match success.get(peer) {
            Some(record) if record.has_enough_data(self.conf.min_requests_for_ratio) => {
                record.ratio() < self.conf.deprioritize_below_ratio
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(byte: u8) -> PeerId {
        [byte; 20]
    }

    fn conf() -> SchedulerConf {
        SchedulerConf {
            batch_size: 2,
            min_requests_for_ratio: 5,
            deprioritize_below_ratio: 0.5,
        }
    }

    #[test]
    fn rarest_block_is_preferred_over_common_one() {
        let scheduler = Scheduler::new(SchedulerConf {
            batch_size: 1,
            ..conf()
        });
        let mut availability = HashMap::new();
        availability.insert(0, vec![peer_id(1), peer_id(2), peer_id(3)]);
        availability.insert(1, vec![peer_id(1)]);

        let plan = scheduler.plan(&[0, 1], &availability, &HashMap::new(), &HashMap::new());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].block, 1);
    }

    #[test]
    fn blocks_with_no_known_holder_are_skipped() {
        let scheduler = Scheduler::new(conf());
        let availability = HashMap::new();
        let plan = scheduler.plan(&[0, 1, 2], &availability, &HashMap::new(), &HashMap::new());
        assert!(plan.is_empty());
    }

    #[test]
    fn provider_choice_prefers_higher_download_rate() {
        let scheduler = Scheduler::new(conf());
        let mut availability = HashMap::new();
        availability.insert(0, vec![peer_id(1), peer_id(2)]);
        let mut rates = HashMap::new();
        rates.insert(peer_id(1), 100.0);
        rates.insert(peer_id(2), 500.0);

        let plan = scheduler.plan(&[0], &availability, &rates, &HashMap::new());
        assert_eq!(plan[0].peer, peer_id(2));
    }

    #[test]
    fn provider_with_poor_success_ratio_is_deprioritized() {
        let scheduler = Scheduler::new(conf());
        let mut availability = HashMap::new();
        availability.insert(0, vec![peer_id(1), peer_id(2)]);
        let mut rates = HashMap::new();
        rates.insert(peer_id(1), 1000.0); // fastest, but unreliable
        rates.insert(peer_id(2), 10.0);
        let mut success = HashMap::new();
        success.insert(
            peer_id(1),
            PeerSuccess {
                completed: 1,
                failed: 9,
            },
        );

        let plan = scheduler.plan(&[0], &availability, &rates, &success);
        assert_eq!(plan[0].peer, peer_id(2));
    }

    #[test]
    fn batch_size_caps_the_number_of_assignments() {
        let scheduler = Scheduler::new(conf());
        let mut availability = HashMap::new();
        for block in 0..5 {
            availability.insert(block, vec![peer_id(1)]);
        }
        let missing: Vec<BlockIndex> = (0..5).collect();
        let plan = scheduler.plan(&missing, &availability, &HashMap::new(), &HashMap::new());
        assert_eq!(plan.len(), 2);
    }
}
