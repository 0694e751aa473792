//! The inbound connection accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::Result;
use crate::wire::session::{PeerSession, SessionShared};

/// Accepts inbound peer connections and spawns a session for each one.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Binds the accept loop to `addr`. Use port `0` to let the OS pick one.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The address actually bound, useful when `addr`'s port was `0`.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until the socket errors out. Each accepted
    /// connection is spawned onto its own task and run to completion
    /// independently; one peer's misbehavior never blocks another's accept.
    pub async fn run(mut self, shared: Arc<SessionShared>) -> Result<()> {
        loop {
            let (socket, addr) = self.listener.accept().await?;
            log::info!("Accepted inbound connection from {}", addr);
            let shared = shared.clone();
            tokio::spawn(async move {
                let (session, _handle) = PeerSession::inbound(shared, addr);
                if let Err(e) = session.run_inbound(socket).await {
                    log::warn!("Inbound session with {} ended: {}", addr, e);
                }
            });
        }
    }
}
