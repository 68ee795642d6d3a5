//! Application request/response types carried inside envelope payloads and
//! served by the JSON surface.
//!
//! Payload encoding is CBOR through serde, the same format the envelope uses.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ProtocolError;

/// Outcome code carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCode {
    #[default]
    Success,
    Error,
    /// No adaptor is registered for the requested chain.
    Unsupported,
}

/// Anything routed by chain name.
pub trait ChainRequest {
    fn chain(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportChainReq {
    pub chain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportChainRep {
    pub code: ReturnCode,
    pub msg: String,
    pub support: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSocialKeyReq {
    pub chain: String,
    pub uuid: String,
    /// Content id returned by a previous set on content-addressed backends.
    #[serde(default)]
    pub file_cid: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialKey {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetSocialKeyRep {
    pub code: ReturnCode,
    pub msg: String,
    pub key_list: Vec<SocialKey>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSocialKeyReq {
    pub chain: String,
    pub uuid: String,
    pub key: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub social_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SetSocialKeyRep {
    pub code: ReturnCode,
    pub msg: String,
    /// PKCS#8 PEM public half of the per-identity RSA key.
    pub pub_key: String,
    /// Private half, AES encrypted then base64 encoded.
    pub priv_key: String,
    /// Content id, set only by content-addressed backends.
    pub file_cid: String,
}

// Key material stays out of logs.
impl std::fmt::Debug for SocialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocialKey")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl std::fmt::Debug for SetSocialKeyReq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetSocialKeyReq")
            .field("chain", &self.chain)
            .field("uuid", &self.uuid)
            .field("key", &"<redacted>")
            .field("password", &"<redacted>")
            .field("social_code", &self.social_code)
            .finish()
    }
}

impl ChainRequest for SupportChainReq {
    fn chain(&self) -> &str {
        &self.chain
    }
}

impl ChainRequest for GetSocialKeyReq {
    fn chain(&self) -> &str {
        &self.chain
    }
}

impl ChainRequest for SetSocialKeyReq {
    fn chain(&self) -> &str {
        &self.chain
    }
}

impl SupportChainRep {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self { code: ReturnCode::Unsupported, msg: msg.into(), support: false }
    }
}

impl GetSocialKeyRep {
    pub fn error(code: ReturnCode, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), key_list: Vec::new() }
    }
}

impl SetSocialKeyRep {
    pub fn error(code: ReturnCode, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), ..Default::default() }
    }
}

/// Encode an inner payload to CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Decode an inner payload from CBOR.
pub fn from_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    ciborium::from_reader(data).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
