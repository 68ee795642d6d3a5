use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use libp2p::{identity::PublicKey, Multiaddr, PeerId};

/// Multihash code of the identity hash; peer ids of small keys (ed25519)
/// embed the protobuf-encoded public key under it.
const IDENTITY_MULTIHASH: u64 = 0x00;

#[derive(Default)]
struct PeerRecord {
    /// Address to expiry.
    addrs: HashMap<Multiaddr, Instant>,
    public_key: Option<PublicKey>,
}

/// Peer address book: addresses with a freshness window plus the public keys
/// used to verify envelopes. Tolerates concurrent reads and inserts.
#[derive(Default)]
pub struct PeerStore {
    inner: RwLock<HashMap<PeerId, PeerRecord>>,
}

pub type SharedPeerStore = Arc<PeerStore>;

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `addrs` for `peer`, each valid for `ttl` from now. Re-adding an
    /// address extends its expiry.
    pub fn add_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>, ttl: Duration) {
        let expires = Instant::now() + ttl;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let record = inner.entry(peer).or_default();
        for addr in addrs {
            let slot = record.addrs.entry(addr).or_insert(expires);
            if *slot < expires {
                *slot = expires;
            }
        }
    }

    pub fn set_public_key(&self, peer: PeerId, key: PublicKey) {
        if key.to_peer_id() != peer {
            tracing::warn!(%peer, "Ignoring public key that does not match peer id");
            return;
        }
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer)
            .or_default()
            .public_key = Some(key);
    }

    /// Public key for a peer already in the store: the one learned from
    /// identify, else the key embedded in an identity-hash peer id. Peers the
    /// store has never seen have no key.
    pub fn public_key(&self, peer: &PeerId) -> Option<PublicKey> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let record = inner.get(peer)?;
        record
            .public_key
            .clone()
            .or_else(|| public_key_from_peer_id(peer))
    }

    /// Unexpired addresses of `peer`.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|r| {
                r.addrs
                    .iter()
                    .filter(|(_, exp)| **exp > now)
                    .map(|(a, _)| a.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Peers with at least one unexpired address.
    pub fn peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, r)| r.addrs.values().any(|exp| *exp > now))
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, peer: &PeerId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }
}

/// Extract the public key from an identity-multihash peer id.
pub fn public_key_from_peer_id(peer: &PeerId) -> Option<PublicKey> {
    let mh: &libp2p::multiaddr::multihash::Multihash<64> = peer.as_ref();
    if mh.code() != IDENTITY_MULTIHASH {
        return None;
    }
    PublicKey::try_decode_protobuf(mh.digest()).ok()
}
