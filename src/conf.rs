//! This module defines the types used to configure the swarm engine and its
//! parts. None of these values are protocol constants: two peers with
//! different configurations still interoperate correctly, they merely
//! schedule and throttle differently.

use std::{net::SocketAddr, time::Duration};

use crate::PeerId;

/// The global configuration for a swarm peer and all its parts.
///
/// Mirrors the component boundaries in the design: scheduling/choking
/// cadences, network timeouts, and local identity are independently
/// overridable, but all default to the semantic defaults given in the
/// design's configuration table.
#[derive(Clone, Debug)]
pub struct Config {
    /// This peer's protocol-level identity, sent in the handshake.
    pub client_id: PeerId,
    /// The address the accept loop binds to serve inbound connections. Use
    /// port `0` to let the OS pick an ephemeral port.
    pub listen_addr: SocketAddr,
    pub choke: ChokeConf,
    pub scheduler: SchedulerConf,
    pub tracker: TrackerConf,
    pub wire: WireConf,
}

impl Config {
    /// Returns a configuration with reasonable defaults and a randomly
    /// generated client id, listening on an OS-assigned loopback port.
    pub fn new() -> Self {
        Self {
            client_id: random_peer_id(),
            listen_addr: "127.0.0.1:0".parse().expect("static addr parses"),
            choke: ChokeConf::default(),
            scheduler: SchedulerConf::default(),
            tracker: TrackerConf::default(),
            wire: WireConf::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a random, but not protocol-meaningful, 20 byte peer id.
pub fn random_peer_id() -> PeerId {
    use rand::RngCore;
    let mut id = [0; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Configuration for the choke controller (C5), tit-for-tat plus optimistic
/// unchoking.
#[derive(Clone, Copy, Debug)]
pub struct ChokeConf {
    /// `K`: the number of regular unchoke slots.
    pub unchoke_slots: usize,
    /// `T_reg`: cadence of the regular (reciprocity) unchoke tick.
    pub regular_interval: Duration,
    /// `T_opt`: cadence of the optimistic unchoke tick.
    pub optimistic_interval: Duration,
    /// The rolling window over which upload/download rates are measured.
    pub rate_window: Duration,
}

impl Default for ChokeConf {
    fn default() -> Self {
        Self {
            unchoke_slots: 4,
            regular_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            rate_window: Duration::from_secs(30),
        }
    }
}

/// Configuration for the rarest-first scheduler (C4).
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConf {
    /// `R`: the number of candidate blocks considered per scheduling cycle.
    pub batch_size: usize,
    /// Peers are only judged on success ratio once they've had at least this
    /// many completed requests; below that there's too little data.
    pub min_requests_for_ratio: usize,
    /// Below this success ratio (0.0-1.0), a peer is pushed to the tail of
    /// tie-breaks rather than blacklisted.
    pub deprioritize_below_ratio: f64,
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self {
            batch_size: 5,
            min_requests_for_ratio: 5,
            deprioritize_below_ratio: 0.5,
        }
    }
}

/// Configuration for the peer directory's (C2) tracker interaction.
#[derive(Clone, Copy, Debug)]
pub struct TrackerConf {
    /// How often the peer directory re-announces to and re-fetches peers
    /// from the tracker.
    pub refresh_interval: Duration,
    /// A known peer not reconfirmed by the tracker within this long is
    /// dropped.
    pub peer_timeout: Duration,
}

impl Default for TrackerConf {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(15),
            peer_timeout: Duration::from_secs(40),
        }
    }
}

/// Configuration for the wire protocol engine (C6).
#[derive(Clone, Copy, Debug)]
pub struct WireConf {
    /// Max time to wait for the counterpart's HANDSHAKE.
    pub handshake_timeout: Duration,
    /// Max time to wait for a single expected in-protocol exchange (e.g.
    /// the BITFIELD immediately following the handshake).
    pub exchange_timeout: Duration,
    /// A connection with no successful message exchange for this long is
    /// closed.
    pub idle_timeout: Duration,
    /// Max time to wait for a PIECE after sending a REQUEST before the slot
    /// is released back to the missing set.
    pub request_timeout: Duration,
    /// Minimum spacing between two REQUESTs sent to the same peer.
    pub request_min_interval: Duration,
}

impl Default for WireConf {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            exchange_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(40),
            request_timeout: Duration::from_secs(10),
            request_min_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let conf = Config::default();
        assert_eq!(conf.choke.unchoke_slots, 4);
        assert_eq!(conf.choke.regular_interval, Duration::from_secs(10));
        assert_eq!(conf.choke.optimistic_interval, Duration::from_secs(30));
        assert_eq!(conf.tracker.refresh_interval, Duration::from_secs(15));
        assert_eq!(conf.tracker.peer_timeout, Duration::from_secs(40));
        assert_eq!(conf.wire.request_min_interval, Duration::from_secs(1));
        assert_eq!(conf.choke.rate_window, Duration::from_secs(30));
        assert_eq!(conf.scheduler.batch_size, 5);
    }
}
