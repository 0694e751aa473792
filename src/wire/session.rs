//! The per-connection session: handshake, bitfield exchange, and the
//! steady-state message loop that serves requests we're authorized to serve
//! and issues requests the scheduler has assigned to this peer.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{select, FutureExt, Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::codec::{Framed, FramedParts};

use crate::choke::ChokeController;
use crate::conf::WireConf;
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::peer_directory::PeerDirectory;
use crate::rate_ledger::RateLedger;
use crate::scheduler::PeerSuccess;
use crate::store::BlockStoreHandle;
use crate::wire::codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use crate::{BlockIndex, Bitfield, PeerId};

/// The swarm-wide view of which blocks each connected peer has advertised,
/// consulted by the scheduler to compute rarity and candidate providers.
#[derive(Default)]
pub struct Availability {
    bitfields: RwLock<HashMap<PeerId, Bitfield>>,
}

impl Availability {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, peer: PeerId, bitfield: Bitfield) {
        self.bitfields.write().await.insert(peer, bitfield);
    }

    pub async fn have(&self, peer: PeerId, index: BlockIndex, block_count: usize) {
        let mut bitfields = self.bitfields.write().await;
        let entry = bitfields
            .entry(peer)
            .or_insert_with(|| Bitfield::from_vec(vec![0u8; (block_count + 7) / 8]));
        if index < entry.len() {
            entry.set(index, true);
        }
    }

    pub async fn forget(&self, peer: &PeerId) {
        self.bitfields.write().await.remove(peer);
    }

    /// Returns, for every missing block, the peers known to have it.
    pub async fn providers_for(&self, missing: &[BlockIndex]) -> HashMap<BlockIndex, Vec<PeerId>> {
        let bitfields = self.bitfields.read().await;
        let mut out: HashMap<BlockIndex, Vec<PeerId>> = HashMap::new();
        for &index in missing {
            let providers: Vec<PeerId> = bitfields
                .iter()
                .filter(|(_, bf)| index < bf.len() && bf[index])
                .map(|(peer, _)| *peer)
                .collect();
            if !providers.is_empty() {
                out.insert(index, providers);
            }
        }
        out
    }
}

/// State shared by every session in the swarm.
pub struct SessionShared {
    pub descriptor: Arc<Descriptor>,
    pub client_id: PeerId,
    pub wire_conf: WireConf,
    pub store: BlockStoreHandle,
    pub choke: Arc<ChokeController>,
    pub rate_ledger: Arc<RateLedger>,
    pub availability: Arc<Availability>,
    pub peer_directory: Arc<PeerDirectory>,
    pub success: Arc<Mutex<HashMap<PeerId, PeerSuccess>>>,
    /// Blocks with a REQUEST outstanding on some connection, swarm-wide.
    /// The scheduler consults this so it never assigns a block that's
    /// already in flight elsewhere (this crate has no endgame mode).
    pub requested: Arc<Mutex<HashSet<BlockIndex>>>,
    /// Every live session, inbound or outbound, keyed by peer id, so the
    /// choke tickers and the scheduler can reach a peer regardless of which
    /// side dialed. A session registers itself here once the handshake
    /// names its peer id and removes itself on disconnect.
    pub connections: Arc<Mutex<HashMap<PeerId, SessionHandle>>>,
    /// Peers that have told us they're interested in a block we hold, kept
    /// swarm-wide so the regular unchoke tick can rank only peers who are
    /// both interested and still need something from us.
    pub peer_interest: Arc<Mutex<HashSet<PeerId>>>,
}

/// The channel on which the swarm sends commands to a running session.
pub type SessionHandle = mpsc::Sender<SessionCommand>;

/// Commands the swarm or scheduler can issue to a live session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Request this block from the peer, once its minimum request interval
    /// has elapsed.
    RequestBlock(BlockIndex),
    /// The choke controller has decided whether this peer is authorized to
    /// receive blocks from us; send the corresponding CHOKE/UNCHOKE message
    /// if that differs from what we last told it.
    SyncChoke(bool),
    /// Whether the peer has a block we still need; sends INTERESTED or
    /// NOT_INTERESTED if that differs from what we last told it.
    SyncInterest(bool),
    Shutdown,
}

struct Status {
    peer_id: Option<PeerId>,
    am_choked: bool,
    am_interested: bool,
    peer_choked: bool,
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            peer_id: None,
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
        }
    }
}

/// A single peer connection and its session state.
pub struct PeerSession {
    shared: Arc<SessionShared>,
    addr: SocketAddr,
    status: Status,
    commands: futures::stream::Fuse<mpsc::Receiver<SessionCommand>>,
    /// A clone of this session's own command sender, so it can register
    /// itself in [`SessionShared::connections`] once its peer id is known.
    self_handle: SessionHandle,
    /// Blocks requested from this peer we're still waiting on, with the
    /// time the request was sent.
    outgoing: HashMap<BlockIndex, Instant>,
    last_request_sent: Option<Instant>,
}

impl PeerSession {
    /// Prepares an outbound session to `addr`; the caller is expected to
    /// `tokio::spawn` the returned session's [`PeerSession::run_outbound`].
    pub fn outbound(shared: Arc<SessionShared>, addr: SocketAddr) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                shared,
                addr,
                status: Status::default(),
                commands: rx.fuse(),
                self_handle: tx.clone(),
                outgoing: HashMap::new(),
                last_request_sent: None,
            },
            tx,
        )
    }

    /// Prepares an inbound session from an already-accepted socket.
    pub fn inbound(shared: Arc<SessionShared>, addr: SocketAddr) -> (Self, SessionHandle) {
        Self::outbound(shared, addr)
    }

    pub async fn run_outbound(mut self, socket: TcpStream) -> Result<()> {
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(
            self.shared.descriptor.descriptor_hash()?,
            self.shared.client_id,
        );
        socket.send(handshake).await?;
        self.complete_handshake(socket).await
    }

    pub async fn run_inbound(mut self, socket: TcpStream) -> Result<()> {
        let mut socket = Framed::new(socket, HandshakeCodec);
        let peer_handshake = tokio::time::timeout(self.shared.wire_conf.handshake_timeout, socket.next())
            .await
            .map_err(|_| Error::TransientNetwork("handshake timed out".into()))?
            .ok_or_else(|| Error::TransientNetwork("connection closed before handshake".into()))??;
        self.verify_handshake(&peer_handshake)?;
        self.status.peer_id = Some(peer_handshake.peer_id);

        let reply = Handshake::new(
            self.shared.descriptor.descriptor_hash()?,
            self.shared.client_id,
        );
        socket.send(reply).await?;
        self.run_session(switch_to_peer_codec(socket)).await
    }

    async fn complete_handshake(&mut self, mut socket: Framed<TcpStream, HandshakeCodec>) -> Result<()> {
        let peer_handshake = tokio::time::timeout(self.shared.wire_conf.handshake_timeout, socket.next())
            .await
            .map_err(|_| Error::TransientNetwork("handshake timed out".into()))?
            .ok_or_else(|| Error::TransientNetwork("connection closed before handshake".into()))??;
        self.verify_handshake(&peer_handshake)?;
        self.status.peer_id = Some(peer_handshake.peer_id);
        self.run_session(switch_to_peer_codec(socket)).await
    }

    fn verify_handshake(&self, handshake: &Handshake) -> Result<()> {
        let expected = self.shared.descriptor.descriptor_hash()?;
        if handshake.descriptor_hash != expected {
            return Err(Error::ProtocolViolation(
                "peer descriptor hash mismatch".into(),
            ));
        }
        Ok(())
    }

    async fn run_session(mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let our_bitfield = self.shared.store.bitfield().await;
        let (mut sink, stream) = socket.split();
        sink.send(Message::Bitfield(our_bitfield)).await?;
        let mut stream = stream.fuse();

        let peer_id = self.status.peer_id.expect("handshake completed");
        let block_count = self.shared.descriptor.block_count();
        let mut last_activity = Instant::now();

        self.shared
            .connections
            .lock()
            .await
            .insert(peer_id, self.self_handle.clone());

        // Every loop exit, success or failure, must release this peer's
        // rate/availability bookkeeping and hand any outstanding requests
        // back to the swarm-wide in-flight set, so `break`/`return` below
        // all funnel through `result` rather than skip the cleanup.
        let result: Result<()> = 'session: loop {
            let since_activity = Instant::now().duration_since(last_activity);
            let idle_remaining = self.shared.wire_conf.idle_timeout.saturating_sub(since_activity);
            let idle = tokio::time::delay_for(idle_remaining);
            let request_check = tokio::time::delay_for(Duration::from_secs(1));
            select! {
                msg = stream.select_next_some() => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => break 'session Err(e),
                    };
                    last_activity = Instant::now();
                    if let Err(e) = self.handle_message(&mut sink, peer_id, block_count, msg).await {
                        break 'session Err(e);
                    }
                }
                cmd = self.commands.select_next_some() => {
                    last_activity = Instant::now();
                    let outcome = match cmd {
                        SessionCommand::RequestBlock(index) => self.request_block(&mut sink, index).await,
                        SessionCommand::SyncChoke(unchoked) => self.sync_choke(&mut sink, unchoked).await,
                        SessionCommand::SyncInterest(interested) => self.sync_interest(&mut sink, interested).await,
                        SessionCommand::Shutdown => {
                            log::info!("Ending session with {}", self.addr);
                            break 'session Ok(());
                        }
                    };
                    if let Err(e) = outcome {
                        break 'session Err(e);
                    }
                }
                _ = idle.fuse() => {
                    log::warn!("Peer {} idle for too long, closing", self.addr);
                    break 'session Err(Error::TransientNetwork("idle timeout".into()));
                }
                _ = request_check.fuse() => {
                    self.check_request_timeouts(peer_id).await;
                }
            }
        };

        self.shared.availability.forget(&peer_id).await;
        self.shared.rate_ledger.forget(&peer_id).await;
        self.shared.connections.lock().await.remove(&peer_id);
        self.shared.peer_interest.lock().await.remove(&peer_id);
        self.shared.peer_directory.remove(&peer_id).await;
        if !self.outgoing.is_empty() {
            let mut requested = self.shared.requested.lock().await;
            for index in self.outgoing.keys() {
                requested.remove(index);
            }
        }
        result
    }

    async fn handle_message(
        &mut self,
        sink: &mut (impl Sink<Message, Error = Error> + Unpin),
        peer_id: PeerId,
        block_count: usize,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.status.am_choked = true;
                self.outgoing.clear();
            }
            Message::Unchoke => {
                self.status.am_choked = false;
            }
            Message::Interested => {
                self.status.peer_interested = true;
                self.shared.peer_interest.lock().await.insert(peer_id);
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
                self.shared.peer_interest.lock().await.remove(&peer_id);
            }
            Message::Bitfield(mut bitfield) => {
                validate_bitfield_padding(&bitfield, block_count)?;
                bitfield.truncate(block_count);
                self.shared.availability.set(peer_id, bitfield).await;
            }
            Message::Have(index) => {
                self.shared.availability.have(peer_id, index, block_count).await;
            }
            Message::Request(index) => {
                self.serve_request(sink, peer_id, index).await?;
            }
            Message::Piece(index, data) => {
                self.handle_piece(peer_id, index, data).await;
            }
        }
        Ok(())
    }

    async fn serve_request(
        &mut self,
        sink: &mut (impl Sink<Message, Error = Error> + Unpin),
        peer_id: PeerId,
        index: BlockIndex,
    ) -> Result<()> {
        let snapshot = self.shared.choke.snapshot().await;
        if !snapshot.is_unchoked(&peer_id) {
            log::debug!("Ignoring request from choked peer {}", self.addr);
            return Ok(());
        }
        match self.shared.store.read(index).await {
            Ok(data) => {
                self.shared.rate_ledger.record_up(peer_id, data.len() as u64).await;
                sink.send(Message::Piece(index, data)).await?;
            }
            Err(_) => {
                log::debug!("Peer {} requested block {} we don't have", self.addr, index);
            }
        }
        Ok(())
    }

    async fn handle_piece(&mut self, peer_id: PeerId, index: BlockIndex, data: Vec<u8>) {
        if self.outgoing.remove(&index).is_none() {
            log::warn!("Peer {} sent unrequested block {}", self.addr, index);
            return;
        }
        self.shared.requested.lock().await.remove(&index);

        let len = data.len() as u64;
        match self.shared.store.insert(index, data).await {
            Ok(_) => {
                self.shared.rate_ledger.record_down(peer_id, len).await;
                self.record_outcome(peer_id, true).await;
            }
            Err(Error::BadHash) => {
                log::warn!("Peer {} sent block {} failing hash check", self.addr, index);
                self.record_outcome(peer_id, false).await;
            }
            Err(e) => {
                log::warn!("Failed to store block {} from peer {}: {}", index, self.addr, e);
                self.record_outcome(peer_id, false).await;
            }
        }
    }

    async fn record_outcome(&self, peer_id: PeerId, success: bool) {
        let mut table = self.shared.success.lock().await;
        let entry = table.entry(peer_id).or_default();
        if success {
            entry.completed += 1;
        } else {
            entry.failed += 1;
        }
    }

    async fn sync_choke(
        &mut self,
        sink: &mut (impl Sink<Message, Error = Error> + Unpin),
        unchoked: bool,
    ) -> Result<()> {
        // peer_choked tracks our current choke of them; a message is only
        // due when that disagrees with the freshly computed decision.
        if self.status.peer_choked == unchoked {
            self.status.peer_choked = !unchoked;
            sink.send(if unchoked { Message::Unchoke } else { Message::Choke })
                .await?;
        }
        Ok(())
    }

    async fn sync_interest(
        &mut self,
        sink: &mut (impl Sink<Message, Error = Error> + Unpin),
        interested: bool,
    ) -> Result<()> {
        if self.status.am_interested != interested {
            self.status.am_interested = interested;
            sink.send(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            })
            .await?;
        }
        Ok(())
    }

    async fn request_block(
        &mut self,
        sink: &mut (impl Sink<Message, Error = Error> + Unpin),
        index: BlockIndex,
    ) -> Result<()> {
        if self.status.am_choked {
            return Ok(());
        }
        if self.outgoing.contains_key(&index) {
            // Already have a live REQUEST for this block on this connection.
            return Ok(());
        }
        let min_interval = self.shared.wire_conf.request_min_interval;
        if let Some(last) = self.last_request_sent {
            let elapsed = Instant::now().duration_since(last);
            if elapsed < min_interval {
                tokio::time::delay_for(min_interval - elapsed).await;
            }
        }
        sink.send(Message::Request(index)).await?;
        self.outgoing.insert(index, Instant::now());
        self.last_request_sent = Some(Instant::now());
        Ok(())
    }

    /// Returns block indices whose request has outlived `request_timeout`,
    /// removing them from the outstanding set so they can be reassigned.
    pub fn expire_stale_requests(&mut self) -> HashSet<BlockIndex> {
        let timeout = self.shared.wire_conf.request_timeout;
        let now = Instant::now();
        let stale: Vec<BlockIndex> = self
            .outgoing
            .iter()
            .filter(|(_, sent_at)| now.duration_since(**sent_at) > timeout)
            .map(|(index, _)| *index)
            .collect();
        for index in &stale {
            self.outgoing.remove(index);
        }
        stale.into_iter().collect()
    }

    /// Releases any requests to this peer that have outlived the per-request
    /// timeout back to the swarm-wide missing set, and counts each as a
    /// failed request against the peer.
    async fn check_request_timeouts(&mut self, peer_id: PeerId) {
        let stale = self.expire_stale_requests();
        if stale.is_empty() {
            return;
        }
        {
            let mut requested = self.shared.requested.lock().await;
            for index in &stale {
                requested.remove(index);
            }
        }
        for index in stale {
            log::debug!("Request for block {} to peer {} timed out", index, self.addr);
            self.record_outcome(peer_id, false).await;
        }
    }
}

/// A received bitfield may be padded to a byte boundary; the padding bits
/// must all be zero, since they address no real block.
fn validate_bitfield_padding(bitfield: &crate::Bitfield, block_count: usize) -> Result<()> {
    if bitfield.len() > block_count && bitfield[block_count..].any() {
        return Err(Error::ProtocolViolation(
            "bitfield has non-zero padding bits".into(),
        ));
    }
    Ok(())
}

fn switch_to_peer_codec(socket: Framed<TcpStream, HandshakeCodec>) -> Framed<TcpStream, PeerCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared() -> (Arc<SessionShared>, tempfile::TempDir) {
        let data: Vec<u8> = (0..32u8).collect();
        let descriptor = Descriptor::from_bytes("test.bin", &data, 16);
        let dir = tempfile::tempdir().unwrap();
        let layout = crate::BlockLayout::new(&descriptor, dir.path());
        let descriptor = Arc::new(descriptor);
        let store = BlockStoreHandle::spawn(descriptor.clone(), layout).unwrap();
        let shared = Arc::new(SessionShared {
            descriptor,
            client_id: [0u8; 20],
            wire_conf: WireConf::default(),
            store,
            choke: Arc::new(ChokeController::new(crate::conf::ChokeConf::default())),
            rate_ledger: Arc::new(RateLedger::new(Duration::from_secs(30))),
            availability: Arc::new(Availability::new()),
            peer_directory: Arc::new(PeerDirectory::new(Duration::from_secs(40))),
            success: Arc::new(Mutex::new(HashMap::new())),
            requested: Arc::new(Mutex::new(HashSet::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
            peer_interest: Arc::new(Mutex::new(HashSet::new())),
        });
        (shared, dir)
    }

    fn test_session(shared: Arc<SessionShared>) -> PeerSession {
        let (session, _handle) = PeerSession::outbound(shared, "127.0.0.1:1".parse().unwrap());
        session
    }

    #[tokio::test]
    async fn request_block_is_not_resent_while_outstanding() {
        let (shared, _dir) = test_shared();
        let mut session = test_session(shared);
        session.status.am_choked = false;
        let (tx, rx) = futures::channel::mpsc::channel::<Message>(8);
        let mut sink = tx.sink_map_err(|_| Error::TransientNetwork("sink closed".into()));

        session.request_block(&mut sink, 0).await.unwrap();
        session.request_block(&mut sink, 0).await.unwrap();
        drop(sink);

        let received: Vec<Message> = rx.collect().await;
        assert_eq!(received, vec![Message::Request(0)]);
    }

    #[tokio::test]
    async fn expire_stale_requests_releases_overdue_blocks() {
        let (shared, _dir) = test_shared();
        let mut session = test_session(shared);
        session.outgoing.insert(3, Instant::now() - Duration::from_secs(20));

        let stale = session.expire_stale_requests();

        assert_eq!(stale, [3].iter().copied().collect());
        assert!(session.outgoing.is_empty());
    }

    #[tokio::test]
    async fn check_request_timeouts_releases_shared_in_flight_and_counts_failure() {
        let (shared, _dir) = test_shared();
        shared.requested.lock().await.insert(5);
        let mut session = test_session(shared.clone());
        session.outgoing.insert(5, Instant::now() - Duration::from_secs(20));
        let peer_id = [9u8; 20];

        session.check_request_timeouts(peer_id).await;

        assert!(session.outgoing.is_empty());
        assert!(!shared.requested.lock().await.contains(&5));
        let success = shared.success.lock().await;
        assert_eq!(success.get(&peer_id).unwrap().failed, 1);
    }

    #[tokio::test]
    async fn interested_message_adds_peer_to_shared_set_and_not_interested_removes_it() {
        let (shared, _dir) = test_shared();
        let mut session = test_session(shared.clone());
        let (tx, _rx) = futures::channel::mpsc::channel::<Message>(8);
        let mut sink = tx.sink_map_err(|_| Error::TransientNetwork("sink closed".into()));
        let peer_id = [4u8; 20];

        session
            .handle_message(&mut sink, peer_id, 4, Message::Interested)
            .await
            .unwrap();
        assert!(shared.peer_interest.lock().await.contains(&peer_id));

        session
            .handle_message(&mut sink, peer_id, 4, Message::NotInterested)
            .await
            .unwrap();
        assert!(!shared.peer_interest.lock().await.contains(&peer_id));
    }

    #[tokio::test]
    async fn availability_have_sets_a_single_bit() {
        let availability = Availability::new();
        let peer = [1u8; 20];
        availability.have(peer, 2, 8).await;
        let providers = availability.providers_for(&[2]).await;
        assert_eq!(providers.get(&2), Some(&vec![peer]));
    }

    #[tokio::test]
    async fn availability_set_replaces_whole_bitfield() {
        let availability = Availability::new();
        let peer = [1u8; 20];
        let mut bitfield = Bitfield::from_vec(vec![0u8; 1]);
        bitfield.set(0, true);
        bitfield.set(3, true);
        availability.set(peer, bitfield).await;

        let providers = availability.providers_for(&[0, 1, 3]).await;
        assert_eq!(providers.len(), 2);
        assert!(providers.contains_key(&0));
        assert!(providers.contains_key(&3));
    }

    #[tokio::test]
    async fn forget_removes_a_peer_from_availability() {
        let availability = Availability::new();
        let peer = [1u8; 20];
        availability.have(peer, 0, 8).await;
        availability.forget(&peer).await;
        let providers = availability.providers_for(&[0]).await;
        assert!(providers.is_empty());
    }

    #[test]
    fn bitfield_padding_must_be_zero() {
        let mut bitfield = Bitfield::from_vec(vec![0u8; 1]);
        bitfield.set(0, true);
        assert!(validate_bitfield_padding(&bitfield, 4).is_ok());

        bitfield.set(7, true);
        assert!(validate_bitfield_padding(&bitfield, 4).is_err());
    }
}
