use ciborium::value::Value;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    constants::{CLIENT_VERSION, MAX_MESSAGE_SIZE, PROTOCOL_VERSION},
    error::ProtocolError,
    message::MsgType,
};

/// Signed message wrapper exchanged between keylocker nodes.
///
/// Encoded on the wire as a CBOR array in field order. The signature covers
/// the same encoding with `signature` cleared to an empty byte string, so a
/// receiver verifies by clearing it again and re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Envelope format version, currently "1.0.0".
    pub version: String,
    /// Software version of the sending node.
    pub client_version: String,
    /// Base58 peer id of the sender.
    pub node_id: String,
    /// Unix seconds (sender wall clock).
    pub timestamp: u64,
    /// Correlation key. Fresh for requests, copied from the request for responses.
    pub message_id: String,
    /// Whether the message may be re-broadcast by receivers.
    pub gossip: bool,
    pub msg_type: MsgType,
    /// Opaque serialized request or response.
    pub payload: Vec<u8>,
    /// Signature by the sender's identity key; empty while unsigned.
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Create an unsigned envelope stamped with the current time.
    pub fn new(
        msg_type: MsgType,
        node_id: PeerId,
        message_id: impl Into<String>,
        gossip: bool,
        payload: Vec<u8>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            version: PROTOCOL_VERSION.to_string(),
            client_version: CLIENT_VERSION.to_string(),
            node_id: node_id.to_base58(),
            timestamp,
            message_id: message_id.into(),
            gossip,
            msg_type,
            payload,
            signature: Vec::new(),
        }
    }

    /// Build and sign a new envelope with the sender's keypair.
    pub fn build(
        msg_type: MsgType,
        message_id: impl Into<String>,
        payload: Vec<u8>,
        key: &Keypair,
    ) -> Result<Self, ProtocolError> {
        let node_id = key.public().to_peer_id();
        let mut env = Self::new(msg_type, node_id, message_id, false, payload);
        env.sign(key)?;
        Ok(env)
    }

    /// Canonical bytes covered by the signature: the CBOR encoding of this
    /// envelope with `signature` cleared.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self, &[])
    }

    /// Sign this envelope in place.
    pub fn sign(&mut self, key: &Keypair) -> Result<(), ProtocolError> {
        let bytes = self.signing_bytes()?;
        self.signature = key
            .sign(&bytes)
            .map_err(|e| ProtocolError::Signing(e.to_string()))?;
        Ok(())
    }

    /// Check the signature against the claimed sender's public key.
    pub fn verify(&self, key: &PublicKey) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        match self.signing_bytes() {
            Ok(bytes) => key.verify(&bytes, &self.signature),
            Err(_) => false,
        }
    }

    /// Parse `node_id` back into a peer id.
    pub fn sender(&self) -> Result<PeerId, ProtocolError> {
        self.node_id
            .parse::<PeerId>()
            .map_err(|e| ProtocolError::InvalidNodeId {
                node_id: self.node_id.clone(),
                reason: e.to_string(),
            })
    }

    /// Encode to CBOR bytes for the wire.
    pub fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let buf = encode(self, &self.signature)?;
        Self::check_size(buf.len())?;
        Ok(buf)
    }

    /// Decode from CBOR bytes.
    pub fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::check_size(data.len())?;
        let value: Value = ciborium::from_reader(data)
            .map_err(|e| ProtocolError::CborDecode(e.to_string()))?;

        let arr = match value {
            Value::Array(a) => a,
            _ => return Err(ProtocolError::CborDecode("expected array".into())),
        };

        if arr.len() != 9 {
            return Err(ProtocolError::CborDecode(format!(
                "expected 9 fields, got {}",
                arr.len()
            )));
        }

        let version = text_from_value(&arr[0])?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            client_version: text_from_value(&arr[1])?,
            node_id:        text_from_value(&arr[2])?,
            timestamp:      u64_from_value(&arr[3])?,
            message_id:     text_from_value(&arr[4])?,
            gossip:         bool_from_value(&arr[5])?,
            msg_type:       MsgType::from_u16(u16_from_value(&arr[6])?)?,
            payload:        bytes_from_value(&arr[7])?,
            signature:      bytes_from_value(&arr[8])?,
        })
    }

    /// Check total encoded size is within MAX_MESSAGE_SIZE.
    pub fn check_size(encoded_len: usize) -> Result<(), ProtocolError> {
        if encoded_len > MAX_MESSAGE_SIZE {
            Err(ProtocolError::EnvelopeTooLarge {
                size: encoded_len,
                limit: MAX_MESSAGE_SIZE,
            })
        } else {
            Ok(())
        }
    }
}

fn encode(env: &Envelope, signature: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let value = Value::Array(vec![
        Value::Text(env.version.clone()),
        Value::Text(env.client_version.clone()),
        Value::Text(env.node_id.clone()),
        Value::Integer(env.timestamp.into()),
        Value::Text(env.message_id.clone()),
        Value::Bool(env.gossip),
        Value::Integer(env.msg_type.as_u16().into()),
        Value::Bytes(env.payload.clone()),
        Value::Bytes(signature.to_vec()),
    ]);

    let mut buf = Vec::new();
    ciborium::into_writer(&value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// CBOR decoding helpers
// ---------------------------------------------------------------------------

fn u16_from_value(v: &Value) -> Result<u16, ProtocolError> {
    match v {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            n.try_into().map_err(|_| ProtocolError::CborDecode("u16 overflow".into()))
        }
        _ => Err(ProtocolError::CborDecode("expected integer".into())),
    }
}

fn u64_from_value(v: &Value) -> Result<u64, ProtocolError> {
    match v {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            n.try_into().map_err(|_| ProtocolError::CborDecode("u64 overflow".into()))
        }
        _ => Err(ProtocolError::CborDecode("expected integer".into())),
    }
}

fn text_from_value(v: &Value) -> Result<String, ProtocolError> {
    match v {
        Value::Text(s) => Ok(s.clone()),
        _ => Err(ProtocolError::CborDecode("expected text".into())),
    }
}

fn bool_from_value(v: &Value) -> Result<bool, ProtocolError> {
    match v {
        Value::Bool(b) => Ok(*b),
        _ => Err(ProtocolError::CborDecode("expected bool".into())),
    }
}

fn bytes_from_value(v: &Value) -> Result<Vec<u8>, ProtocolError> {
    match v {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(ProtocolError::CborDecode("expected bytes".into())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
