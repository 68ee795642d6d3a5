use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use libp2p::identity::{self, Keypair, PublicKey};
use libp2p::PeerId;

/// Node identity: the libp2p keypair that secures connections and signs
/// every outbound envelope.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self { keypair: Keypair::generate_ed25519() }
    }

    /// Load from the environment variable named `var`. A missing variable or
    /// an undecodable key is a startup failure.
    pub fn from_env(var: &str) -> anyhow::Result<Self> {
        let encoded = std::env::var(var)
            .map_err(|_| anyhow::anyhow!("private key environment variable {var} is not set"))?;
        let id = Self::from_encoded(&encoded)?;
        tracing::info!(peer_id = %id.peer_id(), "Loaded identity from ${var}");
        Ok(id)
    }

    /// Decode a protobuf-encoded libp2p private key given as hex (optional
    /// `0x` prefix) or standard base64.
    pub fn from_encoded(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("empty private key");
        }
        let hex_str = s.trim_start_matches("0x");
        let bytes = if hex_str.len() % 2 == 0 && hex_str.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(hex_str).map_err(|e| anyhow::anyhow!("invalid private key hex: {e}"))?
        } else {
            B64.decode(s).map_err(|e| anyhow::anyhow!("invalid private key base64: {e}"))?
        };
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid private key encoding: {e}"))?;
        Ok(Self { keypair })
    }

    /// Hex protobuf encoding, the form accepted by `from_encoded`.
    pub fn encode(&self) -> anyhow::Result<String> {
        let bytes = self
            .keypair
            .to_protobuf_encoding()
            .map_err(|e| anyhow::anyhow!("cannot encode keypair: {e}"))?;
        Ok(hex::encode(bytes))
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, identity::SigningError> {
        self.keypair.sign(data)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}
