use std::time::Duration;

use async_trait::async_trait;
use keylocker_protocol::constants::PEER_ADDR_TTL_SECS;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;

use crate::{network::TransportError, peer_store::SharedPeerStore};

/// Upper bound on one recovery dial.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A locally discovered peer and the addresses it announced.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
}

#[async_trait]
pub trait PeerDialer: Send + Sync {
    async fn is_connected(&self, peer: PeerId) -> bool;

    async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), TransportError>;
}

/// Of two peers that discover each other, only the one with the smaller id
/// dials, so a pair never opens two connections at once.
pub fn should_dial(local: &PeerId, remote: &PeerId) -> bool {
    local.to_bytes() < remote.to_bytes()
}

/// Connect to discovered peers and record them in the peer store.
///
/// Runs until the discovery channel closes. Each peer is handled in turn; a
/// failed dial is logged and the peer is retried on its next announcement.
pub async fn run_recovery<D: PeerDialer>(
    local: PeerId,
    dialer: D,
    peer_store: SharedPeerStore,
    mut discovered: mpsc::Receiver<Discovered>,
) {
    let ttl = Duration::from_secs(PEER_ADDR_TTL_SECS);

    while let Some(Discovered { peer, addrs }) = discovered.recv().await {
        if peer == local || !should_dial(&local, &peer) {
            continue;
        }
        if dialer.is_connected(peer).await {
            peer_store.add_addrs(peer, addrs, ttl);
            continue;
        }

        tracing::info!(%peer, ?addrs, "Dialing discovered peer");
        match tokio::time::timeout(DIAL_TIMEOUT, dialer.dial(peer, addrs.clone())).await {
            Ok(Ok(())) => {
                peer_store.add_addrs(peer, addrs, ttl);
                tracing::info!(%peer, known = peer_store.len(), "Peer recovered");
            }
            Ok(Err(e)) => tracing::warn!(%peer, "Recovery dial failed: {e}"),
            Err(_) => tracing::warn!(%peer, timeout = ?DIAL_TIMEOUT, "Recovery dial timed out"),
        }
    }
    tracing::debug!("Discovery channel closed, recovery loop exiting");
}
