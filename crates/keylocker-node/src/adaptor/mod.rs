//! Chain adaptors: backends that store and return per-identity social keys.
//!
//! Every adaptor implements [`KeyAdaptor`]. The dispatcher builds one adaptor
//! per configured chain through the static factory table in [`factory_for`].

pub mod content;
pub mod contract;
pub mod repo;
pub mod stub;

use std::sync::Arc;

use async_trait::async_trait;
use keylocker_crypto::{CryptoError, SymmetricKey};
use keylocker_protocol::keylocker::{
    GetSocialKeyRep, GetSocialKeyReq, SetSocialKeyRep, SetSocialKeyReq, SupportChainRep,
    SupportChainReq,
};
use thiserror::Error;

use repo::SecretRepo;

pub const ETHEREUM: &str = "Ethereum";
pub const MOONBEAM: &str = "Moonbeam";
pub const IPFS: &str = "Ipfs";
pub const FILECOIN: &str = "Filecoin";

/// Chains with a factory, in registration order.
pub const SUPPORTED_CHAINS: &[&str] = &[ETHEREUM, MOONBEAM, IPFS, FILECOIN];

#[derive(Debug, Error)]
pub enum AdaptorError {
    /// The backend holds nothing for this identity. The only error kind that
    /// makes the node ask its peers.
    #[error("no key stored for uuid {uuid} on {chain}")]
    KeyNotFound { chain: String, uuid: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("codec error for uuid {uuid}: {source}")]
    Crypto {
        uuid: String,
        #[source]
        source: CryptoError,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

impl AdaptorError {
    pub fn crypto(uuid: &str) -> impl FnOnce(CryptoError) -> Self + '_ {
        move |source| Self::Crypto { uuid: uuid.to_string(), source }
    }
}

/// Capability set every backend implements.
#[async_trait]
pub trait KeyAdaptor: Send + Sync {
    /// Chain name this adaptor serves.
    fn chain(&self) -> &str;

    fn get_support_chain(&self, req: &SupportChainReq) -> SupportChainRep;

    async fn get_social_key(&self, req: &GetSocialKeyReq) -> Result<GetSocialKeyRep, AdaptorError>;

    async fn set_social_key(&self, req: &SetSocialKeyReq) -> Result<SetSocialKeyRep, AdaptorError>;
}

/// Everything a factory needs to build an adaptor.
#[derive(Clone)]
pub struct AdaptorContext {
    pub secrets: Arc<SecretRepo>,
    pub aes: SymmetricKey,
    pub rsa_bits: usize,
    pub ethereum_contract: Option<String>,
    pub ipfs_nodes: Vec<String>,
}

impl AdaptorContext {
    pub fn new(aes: SymmetricKey, rsa_bits: usize) -> Self {
        Self {
            secrets: Arc::new(SecretRepo::new()),
            aes,
            rsa_bits,
            ethereum_contract: None,
            ipfs_nodes: Vec::new(),
        }
    }
}

pub type AdaptorFactory = fn(&AdaptorContext) -> Result<Box<dyn KeyAdaptor>, AdaptorError>;

/// Static factory table keyed by chain name.
pub fn factory_for(chain: &str) -> Option<AdaptorFactory> {
    match chain {
        ETHEREUM => Some(contract::ethereum as AdaptorFactory),
        MOONBEAM => Some(contract::moonbeam as AdaptorFactory),
        IPFS => Some(content::ipfs as AdaptorFactory),
        FILECOIN => Some(stub::filecoin as AdaptorFactory),
        _ => None,
    }
}

/// Ledger-style backends address identities by a fixed 32-byte key: the uuid
/// bytes, truncated or zero padded.
pub fn uuid_key(uuid: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = uuid.as_bytes();
    let n = bytes.len().min(32);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn require_uuid(uuid: &str) -> Result<(), AdaptorError> {
    if uuid.is_empty() {
        return Err(AdaptorError::InvalidRequest("uuid must not be empty".into()));
    }
    Ok(())
}
