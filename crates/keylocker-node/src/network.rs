use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use keylocker_protocol::constants::{
    CLIENT_VERSION, GET_KEY_REQUEST, GET_KEY_RESPONSE, IDENTIFY_PROTOCOL_PREFIX, MAX_MESSAGE_SIZE,
};
use libp2p::{
    identify, mdns, noise, request_response, swarm::NetworkBehaviour, tcp, yamux, PeerId,
    StreamProtocol,
};
use thiserror::Error;

/// How long an outbound stream may take to be acknowledged.
const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle connections are kept this long so relays can reuse them.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Wire protocols
// ============================================================================

/// The two one-envelope-per-stream protocols spoken between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireProtocol {
    GetKeyRequest,
    GetKeyResponse,
}

impl WireProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetKeyRequest => GET_KEY_REQUEST,
            Self::GetKeyResponse => GET_KEY_RESPONSE,
        }
    }
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("p2p host is shut down")]
    HostClosed,

    #[error("dial to {peer} failed: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("{protocol} stream to {peer} failed: {reason}")]
    Stream { peer: PeerId, protocol: WireProtocol, reason: String },

    #[error("{peer} answered {protocol} without an ACK")]
    NoAck { peer: PeerId, protocol: WireProtocol },
}

/// Delivers one envelope to one peer and waits for its ACK.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    async fn send(
        &self,
        peer: PeerId,
        protocol: WireProtocol,
        data: Vec<u8>,
    ) -> Result<(), TransportError>;
}

// ============================================================================
// Combined behaviour
// ============================================================================

#[derive(NetworkBehaviour)]
pub struct KeylockerBehaviour {
    /// Inbound: relayed get-key requests. Outbound: our relays.
    pub get_key_request: request_response::Behaviour<EnvelopeCodec>,
    /// Inbound: answers to our relays. Outbound: our answers.
    pub get_key_response: request_response::Behaviour<EnvelopeCodec>,
    pub mdns: mdns::tokio::Behaviour,
    pub identify: identify::Behaviour,
}

/// Identify protocol version; peers with a different rendezvous are ignored.
pub fn identify_protocol_version(rendezvous: &str) -> String {
    format!("{IDENTIFY_PROTOCOL_PREFIX}{rendezvous}")
}

// ============================================================================
// Length-prefixed request-response codec
// ============================================================================

/// 4-byte LE length prefix codec.
/// Request  = one CBOR-encoded envelope
/// Response = 3-byte ACK b"ACK"
#[derive(Clone, Default)]
pub struct EnvelopeCodec;

#[async_trait]
impl request_response::Codec for EnvelopeCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = Vec<u8>;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io, MAX_MESSAGE_SIZE).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io, 64).await
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &res).await
    }
}

async fn read_framed<T: AsyncRead + Unpin>(io: &mut T, max: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds limit"));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_framed<T: AsyncWrite + Unpin>(io: &mut T, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    io.write_all(&len.to_le_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await
}

// ============================================================================
// Swarm builder
// ============================================================================

fn request_response_behaviour(protocol: WireProtocol) -> request_response::Behaviour<EnvelopeCodec> {
    request_response::Behaviour::<EnvelopeCodec>::new(
        [(
            StreamProtocol::new(protocol.as_str()),
            request_response::ProtocolSupport::Full,
        )],
        request_response::Config::default().with_request_timeout(STREAM_TIMEOUT),
    )
}

/// Build the libp2p swarm: TCP + Noise + Yamux, mDNS discovery, identify and
/// the two envelope protocols.
pub fn build_swarm(
    keypair: libp2p::identity::Keypair,
    listen_addr: libp2p::Multiaddr,
    rendezvous: &str,
) -> anyhow::Result<libp2p::Swarm<KeylockerBehaviour>> {
    let protocol_version = identify_protocol_version(rendezvous);

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_dns()?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>)?;

            let identify = identify::Behaviour::new(
                identify::Config::new(protocol_version, key.public())
                    .with_agent_version(CLIENT_VERSION.to_string()),
            );

            Ok(KeylockerBehaviour {
                get_key_request: request_response_behaviour(WireProtocol::GetKeyRequest),
                get_key_response: request_response_behaviour(WireProtocol::GetKeyResponse),
                mdns,
                identify,
            })
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    swarm.listen_on(listen_addr)?;
    Ok(swarm)
}
