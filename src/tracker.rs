//! The tracker client (§6.2): a thin HTTP/JSON client for registering this
//! peer with a swarm's tracker and fetching its current peer list.
//!
//! The tracker is advisory, not authoritative: if it's unreachable, the
//! peer directory simply keeps whatever peer set it already knows about.
//! Callers are expected to treat every error from this module as soft and
//! retry on the next refresh tick rather than propagate it upward.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{PeerId, Sha1Hash};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct RegisterRequest {
    descriptor_hash: String,
    peer_id: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct GetPeersRequest {
    descriptor_hash: String,
}

#[derive(Debug, Deserialize)]
struct GetPeersResponse {
    peers: Vec<WirePeer>,
}

#[derive(Debug, Deserialize)]
struct WirePeer {
    peer_id: String,
    host: String,
    port: u16,
}

/// A client for one tracker, scoped to one swarm (identified by its
/// descriptor hash).
pub struct TrackerClient {
    base_url: String,
    descriptor_hash: Sha1Hash,
    http: reqwest::Client,
}

impl TrackerClient {
    pub fn new(base_url: impl Into<String>, descriptor_hash: Sha1Hash) -> Self {
        Self {
            base_url: base_url.into(),
            descriptor_hash,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("building reqwest client never fails with only a timeout set"),
        }
    }

    /// Announces this peer's presence and listening port to the tracker.
    pub async fn register(&self, peer_id: PeerId, listen_port: u16) -> Result<()> {
        let body = RegisterRequest {
            descriptor_hash: hex::encode(self.descriptor_hash),
            peer_id: hex::encode(peer_id),
            port: listen_port,
        };
        self.http
            .post(&format!("{}/register", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Fetches the tracker's current peer list for this swarm.
    ///
    /// The tracker's returned set is advisory: it may include peers that
    /// have since gone away, or omit peers that connect to us directly.
    pub async fn get_peers(&self) -> Result<Vec<(PeerId, SocketAddr)>> {
        let body = GetPeersRequest {
            descriptor_hash: hex::encode(self.descriptor_hash),
        };
        let response: GetPeersResponse = self
            .http
            .post(&format!("{}/get_peers", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut peers = Vec::with_capacity(response.peers.len());
        for peer in response.peers {
            let peer_id = decode_peer_id(&peer.peer_id)?;
            let addr: SocketAddr = format!("{}:{}", peer.host, peer.port)
                .parse()
                .map_err(|_| {
                    crate::error::Error::ProtocolViolation(format!(
                        "tracker returned an invalid peer address {}:{}",
                        peer.host, peer.port
                    ))
                })?;
            peers.push((peer_id, addr));
        }
        Ok(peers)
    }
}

fn decode_peer_id(encoded: &str) -> Result<PeerId> {
    let bytes = hex::decode(encoded)
        .map_err(|_| crate::error::Error::ProtocolViolation("malformed peer id from tracker".into()))?;
    if bytes.len() != 20 {
        return Err(crate::error::Error::ProtocolViolation(
            "tracker peer id is not 20 bytes".into(),
        ));
    }
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&bytes);
    Ok(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_posts_to_the_expected_path() {
        let _guard = mockito::mock("POST", "/register").with_status(200).create();

        let client = TrackerClient::new(mockito::server_url(), [1u8; 20]);
        client.register([2u8; 20], 6881).await.unwrap();
    }

    #[tokio::test]
    async fn get_peers_parses_the_tracker_response() {
        let peer_id_hex = hex::encode([9u8; 20]);
        let body = format!(
            r#"{{"peers":[{{"peer_id":"{}","host":"127.0.0.1","port":6881}}]}}"#,
            peer_id_hex
        );
        let _guard = mockito::mock("POST", "/get_peers")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create();

        let client = TrackerClient::new(mockito::server_url(), [1u8; 20]);
        let peers = client.get_peers().await.unwrap();

        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, [9u8; 20]);
        assert_eq!(peers[0].1, "127.0.0.1:6881".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn register_propagates_a_server_error() {
        let _guard = mockito::mock("POST", "/register").with_status(500).create();

        let client = TrackerClient::new(mockito::server_url(), [1u8; 20]);
        assert!(client.register([2u8; 20], 6881).await.is_err());
    }
}
