use std::sync::Arc;
use std::time::Duration;

use keylocker_protocol::{
    keylocker::{to_cbor, GetSocialKeyRep, GetSocialKeyReq},
    MsgType, ProtocolError,
};
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::{
    network::WireProtocol,
    pending::WaitError,
    protocol::GetKeyProtocol,
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no peers in peerStore")]
    NoPeers,

    #[error("nil request")]
    NilRequest,

    #[error("no p2p host to relay request")]
    NoRelayHost,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("relayed response could not be decoded")]
    ResponseUnusable,

    #[error("timed out waiting for relayed response")]
    Timeout,
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Upper bound on send attempts per relay.
    pub attempts: usize,
    /// Log interval while waiting.
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Forwards requests the local backends cannot answer to randomly chosen
/// peers and waits for the first answer.
pub struct FaultTolerance {
    protocol: Arc<GetKeyProtocol>,
    settings: RelaySettings,
}

impl FaultTolerance {
    pub fn new(protocol: Arc<GetKeyProtocol>, settings: RelaySettings) -> Self {
        Self { protocol, settings }
    }

    /// Send `payload` in a signed relay envelope to one peer. Each attempt
    /// picks a peer uniformly at random, with replacement; the number of
    /// attempts is `min(attempts, known peers)`. Returns the message id the
    /// answer will carry. Its slot is registered before the first send.
    pub async fn relay(&self, protocol: WireProtocol, payload: Vec<u8>) -> Result<String, RelayError> {
        let local = self.protocol.local_peer_id();
        let peers: Vec<_> = self
            .protocol
            .peer_store()
            .peers()
            .into_iter()
            .filter(|p| *p != local)
            .collect();
        if peers.is_empty() {
            return Err(RelayError::NoPeers);
        }
        if payload.is_empty() {
            return Err(RelayError::NilRequest);
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        let pending = self.protocol.pending();
        pending.insert(&message_id);

        let data = match self
            .protocol
            .new_envelope(MsgType::RelayRequest, &message_id, payload)
            .and_then(|env| env.to_cbor())
        {
            Ok(data) => data,
            Err(e) => {
                pending.remove(&message_id);
                return Err(e.into());
            }
        };

        let budget = self.settings.attempts.min(peers.len());
        for attempt in 1..=budget {
            let peer = {
                let mut rng = rand::thread_rng();
                match peers.choose(&mut rng) {
                    Some(peer) => *peer,
                    None => break,
                }
            };
            match self.protocol.transport().send(peer, protocol, data.clone()).await {
                Ok(()) => {
                    tracing::info!(%peer, %message_id, attempt, "Request relayed");
                    return Ok(message_id);
                }
                Err(e) => tracing::warn!(%peer, %message_id, attempt, budget, "Relay attempt failed: {e}"),
            }
        }

        pending.remove(&message_id);
        Err(RelayError::NoRelayHost)
    }

    /// Relay a get-key request and wait for the answer.
    pub async fn get_social_key(&self, req: &GetSocialKeyReq) -> Result<GetSocialKeyRep, RelayError> {
        let payload = to_cbor(req)?;
        let message_id = self.relay(WireProtocol::GetKeyRequest, payload).await?;

        let result = self
            .protocol
            .pending()
            .wait(&message_id, self.settings.poll_interval, self.settings.timeout)
            .await;
        match result {
            Ok(Some(rep)) => {
                tracing::info!(%message_id, chain = %req.chain, uuid = %req.uuid, "Relayed answer received");
                Ok(rep)
            }
            Ok(None) | Err(WaitError::Unknown) => Err(RelayError::ResponseUnusable),
            Err(WaitError::Timeout) => {
                tracing::warn!(%message_id, timeout = ?self.settings.timeout, "Relay timed out");
                Err(RelayError::Timeout)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adaptor::{AdaptorContext, ETHEREUM};
    use crate::dispatcher::Dispatcher;
    use crate::network::{PeerTransport, TransportError};
    use crate::peer_store::{PeerStore, SharedPeerStore};
    use async_trait::async_trait;
    use keylocker_crypto::SymmetricKey;
    use keylocker_protocol::keylocker::{ReturnCode, SetSocialKeyReq};
    use libp2p::{identity::Keypair, Multiaddr, PeerId};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) const SETTINGS: RelaySettings = RelaySettings {
        attempts: 3,
        poll_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
    };

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/4001".parse().unwrap()
    }

    fn store_with(peers: &[PeerId]) -> SharedPeerStore {
        let store = Arc::new(PeerStore::new());
        for p in peers {
            store.add_addrs(*p, [addr()], Duration::from_secs(3600));
        }
        store
    }

    /// Every send fails; counts attempts.
    struct DeadTransport {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PeerTransport for DeadTransport {
        fn local_peer_id(&self) -> PeerId {
            PeerId::random()
        }

        async fn send(&self, peer: PeerId, protocol: WireProtocol, _data: Vec<u8>) -> Result<(), TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Stream { peer, protocol, reason: "connection refused".into() })
        }
    }

    fn dead_relay(peers: usize, attempts: usize) -> (FaultTolerance, Arc<DeadTransport>) {
        let transport = Arc::new(DeadTransport { attempts: AtomicUsize::new(0) });
        let ids: Vec<PeerId> = (0..peers).map(|_| PeerId::random()).collect();
        let protocol = GetKeyProtocol::new(
            Keypair::generate_ed25519(),
            store_with(&ids),
            Arc::new(Dispatcher::from_adaptors(Vec::new())),
            transport.clone(),
        );
        let settings = RelaySettings { attempts, ..SETTINGS };
        (FaultTolerance::new(Arc::new(protocol), settings), transport)
    }

    #[tokio::test]
    async fn attempts_are_capped_by_peer_count() {
        for (peers, budget, expected) in [(5, 3, 3), (2, 3, 2), (1, 10, 1)] {
            let (relay, transport) = dead_relay(peers, budget);
            let err = relay.relay(WireProtocol::GetKeyRequest, vec![1]).await.unwrap_err();
            assert!(matches!(err, RelayError::NoRelayHost));
            assert_eq!(err.to_string(), "no p2p host to relay request");
            assert_eq!(transport.attempts.load(Ordering::SeqCst), expected);
            assert!(relay.protocol.pending().is_empty());
        }
    }

    #[tokio::test]
    async fn empty_store_sends_nothing() {
        let (relay, transport) = dead_relay(0, 3);
        let err = relay.relay(WireProtocol::GetKeyRequest, vec![1]).await.unwrap_err();
        assert_eq!(err.to_string(), "no peers in peerStore");
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let (relay, transport) = dead_relay(2, 3);
        let err = relay.relay(WireProtocol::GetKeyRequest, Vec::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::NilRequest));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    }

    // ------------------------------------------------------------------------
    // In-memory two-node network
    // ------------------------------------------------------------------------

    type Hub = Arc<Mutex<HashMap<PeerId, Arc<GetKeyProtocol>>>>;

    /// Delivers sends straight into the addressed node's protocol handler.
    pub(crate) struct HubTransport {
        local: PeerId,
        hub: Hub,
        /// Applied to every outgoing frame.
        tamper: fn(&mut Vec<u8>),
    }

    #[async_trait]
    impl PeerTransport for HubTransport {
        fn local_peer_id(&self) -> PeerId {
            self.local
        }

        async fn send(&self, peer: PeerId, protocol: WireProtocol, mut data: Vec<u8>) -> Result<(), TransportError> {
            let target = self.hub.lock().unwrap().get(&peer).cloned();
            let Some(target) = target else {
                return Err(TransportError::Dial { peer, reason: "unreachable".into() });
            };
            (self.tamper)(&mut data);
            let from = self.local;
            tokio::spawn(async move { target.handle_inbound(from, protocol, data).await });
            Ok(())
        }
    }

    pub(crate) struct TestNode {
        pub protocol: Arc<GetKeyProtocol>,
        pub dispatcher: Arc<Dispatcher>,
    }

    fn untouched(_: &mut Vec<u8>) {}

    fn ethereum_dispatcher() -> Dispatcher {
        let ctx = AdaptorContext::new(SymmetricKey::generate(), 1024);
        Dispatcher::new(&[ETHEREUM.to_string()], &ctx)
    }

    fn spawn_node(hub: &Hub, tamper: fn(&mut Vec<u8>), dispatcher: Dispatcher) -> TestNode {
        let keypair = Keypair::generate_ed25519();
        let local = keypair.public().to_peer_id();
        let dispatcher = Arc::new(dispatcher);
        let transport = Arc::new(HubTransport { local, hub: hub.clone(), tamper });
        let protocol = Arc::new(GetKeyProtocol::new(
            keypair,
            Arc::new(PeerStore::new()),
            dispatcher.clone(),
            transport,
        ));
        hub.lock().unwrap().insert(local, protocol.clone());
        TestNode { protocol, dispatcher }
    }

    /// Two nodes that know each other; B holds the key for u1. `tamper`
    /// applies to frames sent by A.
    pub(crate) async fn linked_pair(tamper: fn(&mut Vec<u8>)) -> (TestNode, TestNode) {
        linked_pair_with(tamper, untouched).await
    }

    /// Two nodes that know each other. A serves Ethereum; B serves no chain.
    pub(crate) fn pair_with_unserved_peer() -> (TestNode, TestNode) {
        let hub: Hub = Arc::default();
        let a = spawn_node(&hub, untouched, ethereum_dispatcher());
        let b = spawn_node(&hub, untouched, Dispatcher::from_adaptors(Vec::new()));
        introduce(&a, &b);
        (a, b)
    }

    fn introduce(a: &TestNode, b: &TestNode) {
        let (a_id, b_id) = (a.protocol.local_peer_id(), b.protocol.local_peer_id());
        a.protocol.peer_store().add_addrs(b_id, [addr()], Duration::from_secs(3600));
        b.protocol.peer_store().add_addrs(a_id, [addr()], Duration::from_secs(3600));
    }

    async fn linked_pair_with(tamper_a: fn(&mut Vec<u8>), tamper_b: fn(&mut Vec<u8>)) -> (TestNode, TestNode) {
        let hub: Hub = Arc::default();
        let a = spawn_node(&hub, tamper_a, ethereum_dispatcher());
        let b = spawn_node(&hub, tamper_b, ethereum_dispatcher());
        introduce(&a, &b);

        let rep = b
            .dispatcher
            .set_social_key(&SetSocialKeyReq {
                chain: ETHEREUM.into(),
                uuid: "u1".into(),
                key: "secret-abc".into(),
                password: String::new(),
                social_code: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(rep.code, ReturnCode::Success);
        (a, b)
    }

    fn get_u1() -> GetSocialKeyReq {
        GetSocialKeyReq { chain: ETHEREUM.into(), uuid: "u1".into(), file_cid: String::new() }
    }

    #[tokio::test]
    async fn miss_is_answered_by_peer() {
        let (a, _b) = linked_pair(untouched).await;
        assert!(a.dispatcher.get_social_key(&get_u1()).await.unwrap_err().is_key_miss());

        let relay = FaultTolerance::new(a.protocol.clone(), SETTINGS);
        let rep = relay.get_social_key(&get_u1()).await.unwrap();
        assert_eq!(rep.code, ReturnCode::Success);
        assert_eq!(rep.key_list.len(), 1);
        assert_eq!(rep.key_list[0].key, "secret-abc");
        assert!(a.protocol.pending().is_empty());
    }

    /// Flips the last signature byte of a frame.
    fn flip_last(data: &mut Vec<u8>) {
        if let Some(b) = data.last_mut() {
            *b ^= 0x01;
        }
    }

    #[tokio::test]
    async fn tampered_response_is_dropped() {
        let (a, _b) = linked_pair_with(untouched, flip_last).await;

        let settings = RelaySettings { timeout: Duration::from_millis(300), ..SETTINGS };
        let relay = FaultTolerance::new(a.protocol.clone(), settings);
        let err = relay.get_social_key(&get_u1()).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout));
    }

    #[tokio::test]
    async fn tampered_request_times_out() {
        let (a, _b) = linked_pair(flip_last).await;

        let settings = RelaySettings { timeout: Duration::from_millis(300), ..SETTINGS };
        let relay = FaultTolerance::new(a.protocol.clone(), settings);
        let err = relay.get_social_key(&get_u1()).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout));
        assert!(a.protocol.pending().is_empty());
    }

    #[tokio::test]
    async fn peer_without_the_chain_stays_silent() {
        let (a, _b) = pair_with_unserved_peer();
        let settings = RelaySettings { timeout: Duration::from_millis(300), ..SETTINGS };
        let relay = FaultTolerance::new(a.protocol.clone(), settings);

        let err = relay.get_social_key(&get_u1()).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout));
        assert!(a.protocol.pending().is_empty());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_a, b) = linked_pair(untouched).await;
        let relay = FaultTolerance::new(b.protocol.clone(), RelaySettings {
            timeout: Duration::from_millis(300),
            ..SETTINGS
        });
        // B asks A, which holds nothing and stays silent.
        let err = relay
            .get_social_key(&GetSocialKeyReq { uuid: "u2".into(), ..get_u1() })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout));
    }
}
