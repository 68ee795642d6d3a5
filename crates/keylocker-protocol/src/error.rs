use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(String),

    #[error("unknown message type: {0:#04x}")]
    UnknownMsgType(u16),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("no public key known for signer {0}")]
    UnknownSigner(String),

    #[error("invalid node id {node_id}: {reason}")]
    InvalidNodeId { node_id: String, reason: String },

    #[error("envelope signed by {claimed} but delivered by {remote}")]
    SignerMismatch { claimed: String, remote: String },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("envelope too large: {size} bytes exceeds {limit}")]
    EnvelopeTooLarge { size: usize, limit: usize },

    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
