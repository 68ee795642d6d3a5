use std::sync::Arc;

use keylocker_protocol::{
    keylocker::{from_cbor, to_cbor, GetSocialKeyRep, GetSocialKeyReq, ReturnCode},
    Envelope, MsgType, ProtocolError,
};
use libp2p::{identity::Keypair, PeerId};

use crate::{
    dispatcher::Dispatcher,
    network::{PeerTransport, WireProtocol},
    peer_store::SharedPeerStore,
    pending::PendingRequests,
};

/// Relay wait slots. `None` marks a response that arrived but could not be used.
pub type RelaySlots = PendingRequests<Option<GetSocialKeyRep>>;

/// Serves the two get-key stream protocols: answers relayed requests from the
/// local dispatcher and routes answers to our own relays into their slots.
pub struct GetKeyProtocol {
    keypair: Keypair,
    peer_store: SharedPeerStore,
    dispatcher: Arc<Dispatcher>,
    pending: Arc<RelaySlots>,
    transport: Arc<dyn PeerTransport>,
}

impl GetKeyProtocol {
    pub fn new(
        keypair: Keypair,
        peer_store: SharedPeerStore,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            keypair,
            peer_store,
            dispatcher,
            pending: Arc::new(PendingRequests::new()),
            transport,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub fn peer_store(&self) -> &SharedPeerStore {
        &self.peer_store
    }

    pub fn pending(&self) -> &Arc<RelaySlots> {
        &self.pending
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Signed envelope from this node.
    pub fn new_envelope(
        &self,
        msg_type: MsgType,
        message_id: &str,
        payload: Vec<u8>,
    ) -> Result<Envelope, ProtocolError> {
        let mut env = Envelope::new(msg_type, self.local_peer_id(), message_id, false, payload);
        self.sign_envelope(&mut env)?;
        Ok(env)
    }

    /// Re-sign `env` with this node's key.
    pub fn sign_envelope(&self, env: &mut Envelope) -> Result<(), ProtocolError> {
        env.sign(&self.keypair)
    }

    /// The envelope must come from the stream's remote peer and carry a valid
    /// signature under that peer's known public key.
    pub fn authenticate(&self, env: &Envelope, remote: &PeerId) -> Result<(), ProtocolError> {
        let sender = env.sender()?;
        if sender != *remote {
            return Err(ProtocolError::SignerMismatch {
                claimed: sender.to_base58(),
                remote: remote.to_base58(),
            });
        }
        let key = self
            .peer_store
            .public_key(&sender)
            .ok_or_else(|| ProtocolError::UnknownSigner(sender.to_base58()))?;
        if !env.verify(&key) {
            return Err(ProtocolError::InvalidSignature);
        }
        Ok(())
    }

    /// Entry point for an ACKed inbound stream.
    pub async fn handle_inbound(&self, remote: PeerId, protocol: WireProtocol, data: Vec<u8>) {
        match protocol {
            WireProtocol::GetKeyRequest => self.on_get_key_request(remote, &data).await,
            WireProtocol::GetKeyResponse => self.on_get_key_response(remote, &data),
        }
    }

    /// Answer a relayed get-key request from the local backends. Only a
    /// successful lookup is answered; an invalid request, an unserved chain or
    /// a failed lookup leaves the requester to time out.
    pub async fn on_get_key_request(&self, remote: PeerId, data: &[u8]) {
        let env = match Envelope::from_cbor(data) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(%remote, "Undecodable get-key request: {e}");
                return;
            }
        };
        if let Err(e) = self.authenticate(&env, &remote) {
            tracing::warn!(%remote, message_id = %env.message_id, "Dropping get-key request: {e}");
            return;
        }
        if !env.msg_type.is_request() {
            tracing::warn!(%remote, msg_type = %env.msg_type, "Unexpected message on request protocol");
            return;
        }
        let req: GetSocialKeyReq = match from_cbor(&env.payload) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(%remote, message_id = %env.message_id, "Bad get-key payload: {e}");
                return;
            }
        };

        tracing::info!(
            %remote,
            message_id = %env.message_id,
            chain = %req.chain,
            uuid = %req.uuid,
            "Serving relayed get-key request",
        );

        if !self.dispatcher.is_supported(&req.chain) {
            tracing::info!(%remote, message_id = %env.message_id, chain = %req.chain, "Chain not served here");
            return;
        }

        // Local backends only, so a miss here never relays again.
        let rep = match self.dispatcher.get_social_key(&req).await {
            Ok(rep) if rep.code == ReturnCode::Success => rep,
            Ok(rep) => {
                tracing::info!(%remote, message_id = %env.message_id, code = ?rep.code, "Relayed lookup not answered");
                return;
            }
            Err(e) => {
                tracing::info!(%remote, message_id = %env.message_id, "Relayed lookup failed: {e}");
                return;
            }
        };

        if let Err(e) = self.respond(remote, &env.message_id, &rep).await {
            tracing::warn!(%remote, message_id = %env.message_id, "Failed to answer relay: {e}");
        }
    }

    async fn respond(
        &self,
        remote: PeerId,
        message_id: &str,
        rep: &GetSocialKeyRep,
    ) -> anyhow::Result<()> {
        let payload = to_cbor(rep)?;
        let env = self.new_envelope(MsgType::GetKeyResponse, message_id, payload)?;
        self.transport
            .send(remote, WireProtocol::GetKeyResponse, env.to_cbor()?)
            .await?;
        tracing::debug!(%remote, message_id, "Relay answer sent");
        Ok(())
    }

    /// Fill the relay slot named by the response's message id.
    pub fn on_get_key_response(&self, remote: PeerId, data: &[u8]) {
        let env = match Envelope::from_cbor(data) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(%remote, "Undecodable get-key response: {e}");
                return;
            }
        };
        if let Err(e) = self.authenticate(&env, &remote) {
            tracing::warn!(%remote, message_id = %env.message_id, "Dropping get-key response: {e}");
            return;
        }
        if env.msg_type != MsgType::GetKeyResponse {
            tracing::warn!(%remote, msg_type = %env.msg_type, "Unexpected message on response protocol");
            return;
        }

        let rep = match from_cbor::<GetSocialKeyRep>(&env.payload) {
            Ok(rep) => Some(rep),
            Err(e) => {
                tracing::warn!(%remote, message_id = %env.message_id, "Unusable relay answer: {e}");
                None
            }
        };
        if !self.pending.deliver(&env.message_id, rep) {
            tracing::info!(%remote, message_id = %env.message_id, "No waiter for relay answer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::{AdaptorContext, ETHEREUM};
    use crate::network::TransportError;
    use crate::peer_store::PeerStore;
    use async_trait::async_trait;
    use keylocker_crypto::SymmetricKey;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records outbound sends instead of delivering them.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(PeerId, WireProtocol, Vec<u8>)>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        fn local_peer_id(&self) -> PeerId {
            PeerId::random()
        }

        async fn send(&self, peer: PeerId, protocol: WireProtocol, data: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((peer, protocol, data));
            Ok(())
        }
    }

    fn node_with(transport: Arc<RecordingTransport>, dispatcher: Dispatcher) -> GetKeyProtocol {
        GetKeyProtocol::new(
            Keypair::generate_ed25519(),
            Arc::new(PeerStore::new()),
            Arc::new(dispatcher),
            transport,
        )
    }

    fn node(transport: Arc<RecordingTransport>) -> GetKeyProtocol {
        node_with(transport, Dispatcher::from_adaptors(Vec::new()))
    }

    /// A peer the node has discovered.
    fn known_peer(proto: &GetKeyProtocol) -> Keypair {
        let key = Keypair::generate_ed25519();
        proto.peer_store().add_addrs(
            key.public().to_peer_id(),
            ["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
            Duration::from_secs(60),
        );
        key
    }

    fn response_from(key: &Keypair, id: &str, rep: &GetSocialKeyRep) -> Vec<u8> {
        Envelope::build(MsgType::GetKeyResponse, id, to_cbor(rep).unwrap(), key)
            .unwrap()
            .to_cbor()
            .unwrap()
    }

    #[test]
    fn authenticate_checks_sender_and_signature() {
        let proto = node(Arc::default());
        let remote = known_peer(&proto);
        let remote_id = remote.public().to_peer_id();

        let env = Envelope::build(MsgType::RelayRequest, "m1", vec![1], &remote).unwrap();
        assert!(proto.authenticate(&env, &remote_id).is_ok());

        let other = PeerId::random();
        assert!(matches!(
            proto.authenticate(&env, &other),
            Err(ProtocolError::SignerMismatch { .. })
        ));

        let mut tampered = env.clone();
        tampered.payload = vec![2];
        assert!(matches!(
            proto.authenticate(&tampered, &remote_id),
            Err(ProtocolError::InvalidSignature)
        ));
    }

    #[test]
    fn signer_missing_from_store_is_unknown() {
        let proto = node(Arc::default());
        let stranger = Keypair::generate_ed25519();
        let env = Envelope::build(MsgType::RelayRequest, "m1", vec![1], &stranger).unwrap();

        assert!(matches!(
            proto.authenticate(&env, &stranger.public().to_peer_id()),
            Err(ProtocolError::UnknownSigner(_))
        ));
    }

    #[tokio::test]
    async fn response_from_stranger_is_dropped() {
        let proto = node(Arc::default());
        let stranger = Keypair::generate_ed25519();
        let rep = GetSocialKeyRep { msg: "ok".into(), ..Default::default() };

        proto.pending().insert("m1");
        proto.on_get_key_response(stranger.public().to_peer_id(), &response_from(&stranger, "m1", &rep));
        // Slot is still open and unfilled.
        assert!(proto.pending().deliver("m1", None));
    }

    #[tokio::test]
    async fn response_fills_waiting_slot() {
        let proto = node(Arc::default());
        let remote = known_peer(&proto);
        let rep = GetSocialKeyRep { msg: "ok".into(), ..Default::default() };

        proto.pending().insert("m1");
        proto.on_get_key_response(remote.public().to_peer_id(), &response_from(&remote, "m1", &rep));

        let got = proto
            .pending()
            .wait("m1", Duration::from_millis(10), Duration::from_secs(1))
            .await;
        assert_eq!(got, Ok(Some(rep)));
    }

    #[tokio::test]
    async fn undecodable_answer_marks_slot_unusable() {
        let proto = node(Arc::default());
        let remote = known_peer(&proto);
        let data = Envelope::build(MsgType::GetKeyResponse, "m1", vec![0xff, 0x00], &remote)
            .unwrap()
            .to_cbor()
            .unwrap();

        proto.pending().insert("m1");
        proto.on_get_key_response(remote.public().to_peer_id(), &data);
        let got = proto
            .pending()
            .wait("m1", Duration::from_millis(10), Duration::from_secs(1))
            .await;
        assert_eq!(got, Ok(None));
    }

    #[test]
    fn forged_response_is_dropped() {
        let proto = node(Arc::default());
        let remote = known_peer(&proto);
        let mut env = Envelope::build(
            MsgType::GetKeyResponse,
            "m1",
            to_cbor(&GetSocialKeyRep::default()).unwrap(),
            &remote,
        )
        .unwrap();
        env.signature[0] ^= 0xff;

        proto.pending().insert("m1");
        proto.on_get_key_response(remote.public().to_peer_id(), &env.to_cbor().unwrap());
        assert!(proto.pending().deliver("m1", None));
    }

    fn relayed_get(remote: &Keypair, chain: &str) -> Vec<u8> {
        let req = GetSocialKeyReq { chain: chain.into(), uuid: "u1".into(), file_cid: String::new() };
        Envelope::build(MsgType::RelayRequest, "m1", to_cbor(&req).unwrap(), remote)
            .unwrap()
            .to_cbor()
            .unwrap()
    }

    fn ethereum_dispatcher() -> Dispatcher {
        let ctx = AdaptorContext::new(SymmetricKey::generate(), 1024);
        Dispatcher::new(&[ETHEREUM.to_string()], &ctx)
    }

    #[tokio::test]
    async fn local_key_miss_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let proto = node_with(transport.clone(), ethereum_dispatcher());
        let remote = known_peer(&proto);

        proto
            .handle_inbound(remote.public().to_peer_id(), WireProtocol::GetKeyRequest, relayed_get(&remote, ETHEREUM))
            .await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unserved_chain_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let proto = node(transport.clone());
        let remote = known_peer(&proto);

        proto.on_get_key_request(remote.public().to_peer_id(), &relayed_get(&remote, ETHEREUM)).await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_from_stranger_is_ignored() {
        let transport = Arc::new(RecordingTransport::default());
        let proto = node_with(transport.clone(), ethereum_dispatcher());
        let stranger = Keypair::generate_ed25519();

        proto.on_get_key_request(stranger.public().to_peer_id(), &relayed_get(&stranger, ETHEREUM)).await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_key_is_answered_with_signed_response() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = ethereum_dispatcher();
        dispatcher
            .set_social_key(&keylocker_protocol::keylocker::SetSocialKeyReq {
                chain: ETHEREUM.into(),
                uuid: "u1".into(),
                key: "secret-abc".into(),
                password: String::new(),
                social_code: String::new(),
            })
            .await
            .unwrap();
        let proto = node_with(transport.clone(), dispatcher);
        let remote = known_peer(&proto);

        proto.on_get_key_request(remote.public().to_peer_id(), &relayed_get(&remote, ETHEREUM)).await;
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, remote.public().to_peer_id());
        assert_eq!(sent[0].1, WireProtocol::GetKeyResponse);

        let answer = Envelope::from_cbor(&sent[0].2).unwrap();
        assert_eq!(answer.message_id, "m1");
        assert_eq!(answer.msg_type, MsgType::GetKeyResponse);
        assert!(answer.verify(&proto.keypair.public()));
        let rep: GetSocialKeyRep = from_cbor(&answer.payload).unwrap();
        assert_eq!(rep.code, ReturnCode::Success);
        assert_eq!(rep.key_list[0].key, "secret-abc");
    }
}
