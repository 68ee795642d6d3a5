use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use keylocker_protocol::constants::{ACK, PEER_ADDR_TTL_SECS};
use libp2p::{
    identify, mdns, request_response,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        DialError, SwarmEvent,
    },
    Multiaddr, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    conn_manager::ConnManager,
    discovery::{Discovered, PeerDialer},
    network::{
        identify_protocol_version, KeylockerBehaviour, KeylockerBehaviourEvent, PeerTransport,
        TransportError, WireProtocol,
    },
    peer_store::SharedPeerStore,
    protocol::GetKeyProtocol,
};

/// How often the connection manager is asked to trim.
const TRIM_INTERVAL: Duration = Duration::from_secs(30);

/// Commands accepted by the host loop.
enum Command {
    Send {
        peer: PeerId,
        protocol: WireProtocol,
        data: Vec<u8>,
        reply: AckReply,
    },
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: AckReply,
    },
    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

type AckReply = oneshot::Sender<Result<(), TransportError>>;

/// Work parked until a dial to the peer settles.
enum DialWaiter {
    Dial(AckReply),
    Send(QueuedSend),
}

struct QueuedSend {
    protocol: WireProtocol,
    data: Vec<u8>,
    reply: AckReply,
}

// ============================================================================
// Client handle
// ============================================================================

/// Cloneable handle to a running [`P2pHost`].
#[derive(Clone)]
pub struct P2pClient {
    local: PeerId,
    commands: mpsc::Sender<Command>,
}

impl P2pClient {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Peers with at least one live connection.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.request(|reply| Command::ConnectedPeers { reply })
            .await
            .unwrap_or_default()
    }
}

#[async_trait]
impl PeerTransport for P2pClient {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn send(
        &self,
        peer: PeerId,
        protocol: WireProtocol,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.request(|reply| Command::Send { peer, protocol, data, reply })
            .await
            .unwrap_or(Err(TransportError::HostClosed))
    }
}

#[async_trait]
impl PeerDialer for P2pClient {
    async fn is_connected(&self, peer: PeerId) -> bool {
        self.request(|reply| Command::IsConnected { peer, reply })
            .await
            .unwrap_or(false)
    }

    async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), TransportError> {
        self.request(|reply| Command::Dial { peer, addrs, reply })
            .await
            .unwrap_or(Err(TransportError::HostClosed))
    }
}

// ============================================================================
// Host
// ============================================================================

/// Owns the swarm. Serves the get-key protocols, tracks identify and mDNS,
/// keeps the connection count between the watermarks, and executes client
/// commands.
pub struct P2pHost {
    commands: mpsc::Receiver<Command>,
    conn_manager: ConnManager,
    peer_store: SharedPeerStore,
    /// Set after construction; the protocol needs a client first.
    protocol: Option<Arc<GetKeyProtocol>>,
    discovered: mpsc::Sender<Discovered>,
    expected_identify: String,

    dial_waiters: HashMap<PeerId, Vec<DialWaiter>>,
    outbound: HashMap<request_response::OutboundRequestId, (PeerId, WireProtocol, AckReply)>,
}

impl P2pHost {
    /// Create the host and the client handle that drives it.
    pub fn new(
        local: PeerId,
        rendezvous: &str,
        conn_manager: ConnManager,
        peer_store: SharedPeerStore,
        discovered: mpsc::Sender<Discovered>,
    ) -> (Self, P2pClient) {
        let (tx, rx) = mpsc::channel(256);
        let host = Self {
            commands: rx,
            conn_manager,
            peer_store,
            protocol: None,
            discovered,
            expected_identify: identify_protocol_version(rendezvous),
            dial_waiters: HashMap::new(),
            outbound: HashMap::new(),
        };
        (host, P2pClient { local, commands: tx })
    }

    pub fn set_protocol(&mut self, protocol: Arc<GetKeyProtocol>) {
        self.protocol = Some(protocol);
    }

    // ========================================================================
    // Main event loop
    // ========================================================================

    pub async fn run(mut self, mut swarm: Swarm<KeylockerBehaviour>) -> anyhow::Result<()> {
        let mut trim_timer = tokio::time::interval(TRIM_INTERVAL);

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(&mut swarm, event);
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(&mut swarm, cmd),
                    None => {
                        tracing::info!("All clients dropped, p2p host stopping");
                        return Ok(());
                    }
                },
                _ = trim_timer.tick() => {
                    self.trim(&mut swarm);
                }
            }
        }
    }

    fn trim(&mut self, swarm: &mut Swarm<KeylockerBehaviour>) {
        for peer in self.conn_manager.trim(Instant::now()) {
            tracing::debug!(%peer, "Trimming connection");
            let _ = swarm.disconnect_peer_id(peer);
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, swarm: &mut Swarm<KeylockerBehaviour>, cmd: Command) {
        match cmd {
            Command::Send { peer, protocol, data, reply } => {
                let queued = QueuedSend { protocol, data, reply };
                if swarm.is_connected(&peer) {
                    self.send_request(swarm, peer, queued);
                } else {
                    let addrs = self.peer_store.addrs(&peer);
                    self.dial(swarm, peer, addrs, DialWaiter::Send(queued));
                }
            }
            Command::Dial { peer, addrs, reply } => {
                if swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                } else {
                    self.dial(swarm, peer, addrs, DialWaiter::Dial(reply));
                }
            }
            Command::IsConnected { peer, reply } => {
                let _ = reply.send(swarm.is_connected(&peer));
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(swarm.connected_peers().copied().collect());
            }
        }
    }

    fn send_request(&mut self, swarm: &mut Swarm<KeylockerBehaviour>, peer: PeerId, send: QueuedSend) {
        let behaviour = swarm.behaviour_mut();
        let rr = match send.protocol {
            WireProtocol::GetKeyRequest => &mut behaviour.get_key_request,
            WireProtocol::GetKeyResponse => &mut behaviour.get_key_response,
        };
        let id = rr.send_request(&peer, send.data);
        self.outbound.insert(id, (peer, send.protocol, send.reply));
    }

    fn dial(
        &mut self,
        swarm: &mut Swarm<KeylockerBehaviour>,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        waiter: DialWaiter,
    ) {
        if addrs.is_empty() {
            waiter.fail(TransportError::Dial { peer, reason: "no known addresses".into() });
            return;
        }

        let opts = DialOpts::peer_id(peer)
            .addresses(addrs)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        match swarm.dial(opts) {
            // Joins the dial already in flight.
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.dial_waiters.entry(peer).or_default().push(waiter);
            }
            Err(e) => waiter.fail(TransportError::Dial { peer, reason: e.to_string() }),
        }
    }

    fn settle_dial(&mut self, swarm: &mut Swarm<KeylockerBehaviour>, peer: PeerId, result: Result<(), String>) {
        let Some(waiters) = self.dial_waiters.remove(&peer) else {
            return;
        };
        for waiter in waiters {
            match (&result, waiter) {
                (Ok(()), DialWaiter::Dial(reply)) => {
                    let _ = reply.send(Ok(()));
                }
                (Ok(()), DialWaiter::Send(send)) => self.send_request(swarm, peer, send),
                (Err(reason), waiter) => {
                    waiter.fail(TransportError::Dial { peer, reason: reason.clone() })
                }
            }
        }
    }

    // ========================================================================
    // Swarm event handlers
    // ========================================================================

    fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<KeylockerBehaviour>,
        event: SwarmEvent<KeylockerBehaviourEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {address}/p2p/{}", swarm.local_peer_id());
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                tracing::debug!("Connected to {peer_id} via {endpoint:?}");
                self.conn_manager.connected(peer_id, Instant::now());
                self.settle_dial(swarm, peer_id, Ok(()));
                self.trim(swarm);
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                tracing::debug!("Disconnected from {peer_id}");
                if num_established == 0 {
                    self.conn_manager.disconnected(&peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer), error, .. } => {
                tracing::warn!("Outgoing connection error to {peer}: {error}");
                if !swarm.is_connected(&peer) {
                    self.settle_dial(swarm, peer, Err(error.to_string()));
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(swarm, event),
            _ => {}
        }
    }

    fn handle_behaviour_event(
        &mut self,
        swarm: &mut Swarm<KeylockerBehaviour>,
        event: KeylockerBehaviourEvent,
    ) {
        match event {
            KeylockerBehaviourEvent::GetKeyRequest(event) => {
                self.handle_request_response(swarm, WireProtocol::GetKeyRequest, event)
            }
            KeylockerBehaviourEvent::GetKeyResponse(event) => {
                self.handle_request_response(swarm, WireProtocol::GetKeyResponse, event)
            }

            KeylockerBehaviourEvent::Mdns(mdns::Event::Discovered(found)) => {
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer, addr) in found {
                    by_peer.entry(peer).or_default().push(addr);
                }
                for (peer, addrs) in by_peer {
                    tracing::debug!("mDNS discovered {peer} at {addrs:?}");
                    if let Err(e) = self.discovered.try_send(Discovered { peer, addrs }) {
                        tracing::warn!(%peer, "Discovery queue full, dropping: {e}");
                    }
                }
            }
            KeylockerBehaviourEvent::Mdns(mdns::Event::Expired(expired)) => {
                for (peer, _addr) in expired {
                    tracing::debug!("mDNS expired {peer}");
                }
            }

            KeylockerBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                if info.protocol_version != self.expected_identify {
                    tracing::warn!(
                        peer = %peer_id,
                        theirs = %info.protocol_version,
                        ours = %self.expected_identify,
                        "Peer is in another rendezvous, disconnecting",
                    );
                    self.peer_store.remove(&peer_id);
                    let _ = swarm.disconnect_peer_id(peer_id);
                    return;
                }
                tracing::debug!("Identified {peer_id}: agent={}", info.agent_version);
                self.peer_store.set_public_key(peer_id, info.public_key);
                self.peer_store.add_addrs(
                    peer_id,
                    info.listen_addrs,
                    Duration::from_secs(PEER_ADDR_TTL_SECS),
                );
            }
            KeylockerBehaviourEvent::Identify(_) => {}
        }
    }

    fn handle_request_response(
        &mut self,
        swarm: &mut Swarm<KeylockerBehaviour>,
        protocol: WireProtocol,
        event: request_response::Event<Vec<u8>, Vec<u8>>,
    ) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    // Always ACK first; the envelope is handled off the loop.
                    let behaviour = swarm.behaviour_mut();
                    let rr = match protocol {
                        WireProtocol::GetKeyRequest => &mut behaviour.get_key_request,
                        WireProtocol::GetKeyResponse => &mut behaviour.get_key_response,
                    };
                    let _ = rr.send_response(channel, ACK.to_vec());

                    match &self.protocol {
                        Some(handler) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                handler.handle_inbound(peer, protocol, request).await
                            });
                        }
                        None => tracing::warn!(%peer, %protocol, "No protocol handler, dropping stream"),
                    }
                }
                request_response::Message::Response { request_id, response } => {
                    if let Some((peer, protocol, reply)) = self.outbound.remove(&request_id) {
                        let result = if response == ACK {
                            Ok(())
                        } else {
                            Err(TransportError::NoAck { peer, protocol })
                        };
                        let _ = reply.send(result);
                    }
                }
            },
            request_response::Event::OutboundFailure { peer, request_id, error } => {
                tracing::warn!("{protocol} outbound failure to {peer}: {error}");
                if let Some((peer, protocol, reply)) = self.outbound.remove(&request_id) {
                    let _ = reply.send(Err(TransportError::Stream {
                        peer,
                        protocol,
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                tracing::warn!("{protocol} inbound failure from {peer}: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}

impl DialWaiter {
    fn fail(self, err: TransportError) {
        let reply = match self {
            Self::Dial(reply) => reply,
            Self::Send(send) => send.reply,
        };
        let _ = reply.send(Err(err));
    }
}
