//! The top-level engine: wires together the block store, peer directory,
//! rate ledger, scheduler, choke controller, and wire protocol engine into
//! one running download/seed session for a single file.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::choke::{ChokeController, UnchokeSnapshot};
use crate::conf::Config;
use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::peer_directory::PeerDirectory;
use crate::rate_ledger::RateLedger;
use crate::scheduler::{PeerSuccess, Scheduler};
use crate::store::BlockStoreHandle;
use crate::tracker::TrackerClient;
use crate::wire::{Availability, Listener, PeerSession, SessionHandle, SessionShared};
use crate::{BlockLayout, PeerId};

/// A running swarm: one file, one descriptor, any number of peer
/// connections.
pub struct Swarm {
    config: Config,
    shared: Arc<SessionShared>,
    peer_directory: Arc<PeerDirectory>,
    scheduler: Scheduler,
    tracker: Option<Arc<TrackerClient>>,
}

impl Swarm {
    /// Builds a swarm for `descriptor`, persisting blocks under `base_dir`.
    ///
    /// `tracker_url` is optional: a swarm can run purely from peers added
    /// via [`Swarm::add_peer`], with no tracker at all.
    pub async fn new(
        config: Config,
        descriptor: Descriptor,
        base_dir: impl Into<PathBuf>,
        tracker_url: Option<String>,
    ) -> Result<Self> {
        descriptor.validate()?;
        let descriptor = Arc::new(descriptor);
        let layout = BlockLayout::new(&descriptor, base_dir);
        let store = BlockStoreHandle::spawn(descriptor.clone(), layout)?;

        let descriptor_hash = descriptor.descriptor_hash()?;
        let tracker = tracker_url.map(|url| Arc::new(TrackerClient::new(url, descriptor_hash)));
        let peer_directory = Arc::new(PeerDirectory::new(config.tracker.peer_timeout));

        let shared = Arc::new(SessionShared {
            descriptor,
            client_id: config.client_id,
            wire_conf: config.wire,
            store,
            choke: Arc::new(ChokeController::new(config.choke)),
            rate_ledger: Arc::new(RateLedger::new(config.choke.rate_window)),
            availability: Arc::new(Availability::new()),
            peer_directory: peer_directory.clone(),
            success: Arc::new(Mutex::new(HashMap::new())),
            requested: Arc::new(Mutex::new(HashSet::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
            peer_interest: Arc::new(Mutex::new(HashSet::new())),
        });

        Ok(Self {
            scheduler: Scheduler::new(config.scheduler),
            peer_directory,
            tracker,
            config,
            shared,
        })
    }

    /// Adds a peer the swarm should attempt to connect to, independent of
    /// whatever the tracker reports.
    pub async fn add_peer(&self, peer_id: PeerId, addr: SocketAddr) {
        self.peer_directory.upsert(peer_id, addr).await;
    }

    /// Runs the swarm until every block is owned, then assembles the file
    /// and returns. The accept loop, tracker refresh, and choke ticks run
    /// as long-lived background tasks for the duration of this call.
    pub async fn run(self) -> Result<()> {
        let listener = Listener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Listening for peers on {}", local_addr);

        let listener_shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run(listener_shared).await {
                log::error!("Accept loop ended: {}", e);
            }
        });

        if let Some(tracker) = self.tracker.clone() {
            self.spawn_tracker_refresh(tracker, local_addr.port());
        }
        self.spawn_choke_ticks();

        loop {
            if self.shared.store.is_complete().await {
                log::info!("Download complete, assembling file");
                self.shared.store.assemble().await?;
                return Ok(());
            }
            self.connect_known_peers().await;
            self.schedule_requests().await;
            tokio::time::delay_for(self.config.wire.request_min_interval).await;
        }
    }

    fn spawn_tracker_refresh(&self, tracker: Arc<TrackerClient>, listen_port: u16) {
        let peer_directory = self.peer_directory.clone();
        let client_id = self.shared.client_id;
        let refresh_interval = self.config.tracker.refresh_interval;
        tokio::spawn(async move {
            loop {
                if let Err(e) = tracker.register(client_id, listen_port).await {
                    log::warn!("Tracker registration failed: {}", e);
                }
                match tracker.get_peers().await {
                    Ok(peers) => peer_directory.refresh_from_tracker(peers).await,
                    Err(e) => log::warn!("Tracker refresh failed, keeping known peers: {}", e),
                }
                peer_directory.evict_stale().await;
                tokio::time::delay_for(refresh_interval).await;
            }
        });
    }

    fn spawn_choke_ticks(&self) {
        let shared = self.shared.clone();
        let regular_interval = self.config.choke.regular_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::delay_for(regular_interval).await;
                // Candidates for the regular tick are peers that have told
                // us they're interested *and* that currently hold at least
                // one block we still need; a peer missing either half gets
                // nothing from reciprocity (it can still land the
                // optimistic slot).
                let connected: Vec<PeerId> = shared.connections.lock().await.keys().copied().collect();
                let peer_interest = shared.peer_interest.lock().await.clone();
                let missing = shared.store.missing().await;
                let providers = shared.availability.providers_for(&missing).await;
                let holds_needed: HashSet<PeerId> = providers.values().flatten().copied().collect();
                let interested: Vec<PeerId> = connected
                    .into_iter()
                    .filter(|p| peer_interest.contains(p) && holds_needed.contains(p))
                    .collect();
                let rates: HashMap<PeerId, f64> = shared.rate_ledger.down_rates().await.into_iter().collect();
                let snapshot = shared.choke.tick_regular(&interested, &rates).await;
                broadcast_choke(&shared.connections, &snapshot).await;
            }
        });

        let shared = self.shared.clone();
        let optimistic_interval = self.config.choke.optimistic_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::delay_for(optimistic_interval).await;
                let candidates: Vec<PeerId> = shared.connections.lock().await.keys().copied().collect();
                let snapshot = shared.choke.tick_optimistic(&candidates).await;
                broadcast_choke(&shared.connections, &snapshot).await;
            }
        });
    }

    async fn connect_known_peers(&self) {
        let snapshot = self.peer_directory.snapshot().await;
        let mut connections = self.shared.connections.lock().await;
        for entry in snapshot.iter() {
            if connections.contains_key(&entry.peer_id) {
                continue;
            }
            let (session, handle) = PeerSession::outbound(self.shared.clone(), entry.addr);
            let addr = entry.addr;
            tokio::spawn(async move {
                match tokio::net::TcpStream::connect(addr).await {
                    Ok(socket) => {
                        if let Err(e) = session.run_outbound(socket).await {
                            log::warn!("Outbound session with {} ended: {}", addr, e);
                        }
                    }
                    Err(e) => log::warn!("Could not connect to peer {}: {}", addr, e),
                }
            });
            connections.insert(entry.peer_id, handle);
        }
    }

    async fn schedule_requests(&self) {
        let missing = self.shared.store.missing().await;
        if missing.is_empty() {
            return;
        }
        // Blocks already in flight on some connection are not re-planned:
        // this crate has no endgame mode, so one outstanding REQUEST per
        // block swarm-wide is the rule, not just per connection.
        let missing: Vec<_> = {
            let requested = self.shared.requested.lock().await;
            missing.into_iter().filter(|b| !requested.contains(b)).collect()
        };
        if missing.is_empty() {
            return;
        }
        let availability = self.shared.availability.providers_for(&missing).await;
        if availability.is_empty() {
            return;
        }

        let connections = self.shared.connections.lock().await;
        let down_rates: HashMap<PeerId, f64> = self.shared.rate_ledger.down_rates().await.into_iter().collect();
        let success: HashMap<PeerId, PeerSuccess> = self.shared.success.lock().await.clone();

        let interested_peers: HashSet<PeerId> = availability
            .values()
            .flatten()
            .copied()
            .collect();
        for (peer, handle) in connections.iter() {
            let _ = handle
                .clone()
                .send(crate::wire::SessionCommand::SyncInterest(
                    interested_peers.contains(peer),
                ))
                .await;
        }

        let plan = self.scheduler.plan(&missing, &availability, &down_rates, &success);
        if !plan.is_empty() {
            let mut requested = self.shared.requested.lock().await;
            for assignment in &plan {
                requested.insert(assignment.block);
            }
        }
        for assignment in plan {
            if let Some(handle) = connections.get(&assignment.peer) {
                let _ = handle
                    .clone()
                    .send(crate::wire::SessionCommand::RequestBlock(assignment.block))
                    .await;
            }
        }
    }
}

/// Pushes the freshly computed choke decision out to every connected
/// session so each one knows whether to send CHOKE or UNCHOKE.
async fn broadcast_choke(
    connections: &Arc<Mutex<HashMap<PeerId, SessionHandle>>>,
    snapshot: &Arc<UnchokeSnapshot>,
) {
    let connections = connections.lock().await;
    for (peer, handle) in connections.iter() {
        let _ = handle
            .clone()
            .send(crate::wire::SessionCommand::SyncChoke(
                snapshot.is_unchoked(peer),
            ))
            .await;
    }
}
