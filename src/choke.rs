//! The choke controller (C5): tit-for-tat reciprocity plus optimistic
//! unchoking.
//!
//! Two independent timers drive this component: a regular tick that ranks
//! interested peers by the download rate they're giving us and unchokes the
//! top `K`, and a slower optimistic tick that unchokes one additional peer
//! outside that set to give new or currently-unproductive peers a chance to
//! prove themselves. The result is published as an `Arc<UnchokeSnapshot>` so
//! the wire engine's serve path can check authorization without locking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::conf::ChokeConf;
use crate::PeerId;

/// A published unchoke decision: who we're currently serving requests from.
#[derive(Debug, Default, Clone)]
pub struct UnchokeSnapshot {
    regular: HashSet<PeerId>,
    optimistic: Option<PeerId>,
}

impl UnchokeSnapshot {
    /// Returns `true` if `peer` is authorized to receive blocks right now,
    /// whether by reciprocity or by the optimistic slot.
    pub fn is_unchoked(&self, peer: &PeerId) -> bool {
        self.regular.contains(peer) || self.optimistic.as_ref() == Some(peer)
    }

    pub fn regular(&self) -> &HashSet<PeerId> {
        &self.regular
    }

    pub fn optimistic(&self) -> Option<PeerId> {
        self.optimistic
    }
}

struct State {
    snapshot: Arc<UnchokeSnapshot>,
    /// When each peer was last picked for the optimistic slot, so the
    /// optimistic tick can favor peers it hasn't tried yet, then the one
    /// tried longest ago.
    last_optimistic: HashMap<PeerId, Instant>,
}

/// The choke controller. Cloned handles share the same published snapshot.
pub struct ChokeController {
    conf: ChokeConf,
    state: Mutex<State>,
}

impl ChokeController {
    pub fn new(conf: ChokeConf) -> Self {
        Self {
            conf,
            state: Mutex::new(State {
                snapshot: Arc::new(UnchokeSnapshot::default()),
                last_optimistic: HashMap::new(),
            }),
        }
    }

    /// Returns the currently published unchoke decision.
    pub async fn snapshot(&self) -> Arc<UnchokeSnapshot> {
        self.state.lock().await.snapshot.clone()
    }

    /// Runs the regular (reciprocity) unchoke tick: ranks `interested` peers
    /// by `down_rates` descending and unchokes the top `unchoke_slots`.
    ///
    /// `interested` should be peers that have expressed interest in blocks
    /// we own; a peer with nothing we want isn't worth unchoking regardless
    /// of its rate.
    pub async fn tick_regular(
        &self,
        interested: &[PeerId],
        down_rates: &HashMap<PeerId, f64>,
    ) -> Arc<UnchokeSnapshot> {
        let mut rng = rand::thread_rng();
        let mut ranked: Vec<PeerId> = interested.to_vec();
        ranked.shuffle(&mut rng);
        ranked.sort_by(|a, b| {
            let rate_a = down_rates.get(a).copied().unwrap_or(0.0);
            let rate_b = down_rates.get(b).copied().unwrap_or(0.0);
            rate_b.partial_cmp(&rate_a).unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(self.conf.unchoke_slots);
        let regular: HashSet<PeerId> = ranked.into_iter().collect();

        let mut state = self.state.lock().await;
        let optimistic = state.snapshot.optimistic.filter(|p| !regular.contains(p));
        state.snapshot = Arc::new(UnchokeSnapshot { regular, optimistic });
        state.snapshot.clone()
    }

    /// Runs the optimistic unchoke tick: picks one peer from `candidates`
    /// not already in the regular set, preferring a peer never optimistically
    /// tried before, then the one tried longest ago, breaking remaining ties
    /// at random.
    pub async fn tick_optimistic(&self, candidates: &[PeerId]) -> Arc<UnchokeSnapshot> {
        let mut state = self.state.lock().await;
        let regular = state.snapshot.regular.clone();
        let pool: Vec<PeerId> = candidates
            .iter()
            .copied()
            .filter(|p| !regular.contains(p))
            .collect();

        let chosen = Self::pick_optimistic(&pool, &state.last_optimistic);
        if let Some(peer) = chosen {
            state.last_optimistic.insert(peer, Instant::now());
        }
        state.snapshot = Arc::new(UnchokeSnapshot {
            regular,
            optimistic: chosen,
        });
        state.snapshot.clone()
    }

    fn pick_optimistic(pool: &[PeerId], last_optimistic: &HashMap<PeerId, Instant>) -> Option<PeerId> {
        if pool.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();

        let untried: Vec<PeerId> = pool
            .iter()
            .copied()
            .filter(|p| !last_optimistic.contains_key(p))
            .collect();
        if !untried.is_empty() {
            return untried.choose(&mut rng).copied();
        }

        pool.iter()
            .copied()
            .min_by_key(|p| last_optimistic.get(p).copied().unwrap_or_else(Instant::now))
    }
}
