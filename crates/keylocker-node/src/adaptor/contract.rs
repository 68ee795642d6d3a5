use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use keylocker_crypto::SymmetricKey;
use keylocker_protocol::keylocker::{
    GetSocialKeyRep, GetSocialKeyReq, ReturnCode, SetSocialKeyRep, SetSocialKeyReq, SocialKey,
    SupportChainRep, SupportChainReq,
};

use super::{
    repo::{KeyRecord, SecretRepo},
    require_uuid, uuid_key, AdaptorContext, AdaptorError, KeyAdaptor, ETHEREUM, MOONBEAM,
};

/// Append-only key ledger, the storage half of a key-locker contract.
/// Entries are RSA ciphertexts keyed by the 32-byte identity key.
#[async_trait]
pub trait KeyLedger: Send + Sync {
    async fn query_social_key(&self, uuid: [u8; 32]) -> Result<Vec<Vec<u8>>, AdaptorError>;

    async fn append_social_key(&self, uuid: [u8; 32], keys: Vec<Vec<u8>>) -> Result<(), AdaptorError>;
}

#[derive(Default)]
pub struct MemoryLedger {
    entries: RwLock<HashMap<[u8; 32], Vec<Vec<u8>>>>,
}

#[async_trait]
impl KeyLedger for MemoryLedger {
    async fn query_social_key(&self, uuid: [u8; 32]) -> Result<Vec<Vec<u8>>, AdaptorError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_social_key(&self, uuid: [u8; 32], keys: Vec<Vec<u8>>) -> Result<(), AdaptorError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uuid)
            .or_default()
            .extend(keys);
        Ok(())
    }
}

/// Contract-backed adaptor. Social keys are RSA encrypted under the identity's
/// keypair and appended to the ledger; a get decrypts every entry.
pub struct ContractAdaptor {
    chain: &'static str,
    contract: Option<String>,
    ledger: Arc<dyn KeyLedger>,
    secrets: Arc<SecretRepo>,
    aes: SymmetricKey,
    rsa_bits: usize,
}

pub fn ethereum(ctx: &AdaptorContext) -> Result<Box<dyn KeyAdaptor>, AdaptorError> {
    Ok(Box::new(ContractAdaptor::new(ETHEREUM, ctx, Arc::new(MemoryLedger::default()))))
}

pub fn moonbeam(ctx: &AdaptorContext) -> Result<Box<dyn KeyAdaptor>, AdaptorError> {
    Ok(Box::new(ContractAdaptor::new(MOONBEAM, ctx, Arc::new(MemoryLedger::default()))))
}

impl ContractAdaptor {
    pub fn new(chain: &'static str, ctx: &AdaptorContext, ledger: Arc<dyn KeyLedger>) -> Self {
        match &ctx.ethereum_contract {
            Some(addr) => tracing::info!(chain, contract = %addr, "Contract adaptor ready"),
            None => tracing::info!(chain, "Contract adaptor ready (in-memory ledger)"),
        }
        Self {
            chain,
            contract: ctx.ethereum_contract.clone(),
            ledger,
            secrets: ctx.secrets.clone(),
            aes: ctx.aes.clone(),
            rsa_bits: ctx.rsa_bits,
        }
    }
}

#[async_trait]
impl KeyAdaptor for ContractAdaptor {
    fn chain(&self) -> &str {
        self.chain
    }

    fn get_support_chain(&self, _req: &SupportChainReq) -> SupportChainRep {
        SupportChainRep {
            code: ReturnCode::Success,
            msg: "get support chain success".into(),
            support: true,
        }
    }

    async fn get_social_key(&self, req: &GetSocialKeyReq) -> Result<GetSocialKeyRep, AdaptorError> {
        require_uuid(&req.uuid)?;

        let entries = self.ledger.query_social_key(uuid_key(&req.uuid)).await?;
        if entries.is_empty() {
            return Err(AdaptorError::KeyNotFound {
                chain: self.chain.to_string(),
                uuid: req.uuid.clone(),
            });
        }

        let codec = self.secrets.load_rsa(self.chain, &req.uuid, &self.aes)?;

        let mut key_list = Vec::with_capacity(entries.len());
        for entry in entries {
            let plain = codec.decrypt(&entry).map_err(AdaptorError::crypto(&req.uuid))?;
            key_list.push(SocialKey {
                id: String::new(),
                key: String::from_utf8_lossy(&plain).into_owned(),
            });
        }

        Ok(GetSocialKeyRep {
            code: ReturnCode::Success,
            msg: "get social key success".into(),
            key_list,
        })
    }

    async fn set_social_key(&self, req: &SetSocialKeyReq) -> Result<SetSocialKeyRep, AdaptorError> {
        require_uuid(&req.uuid)?;

        let (codec, record) = self
            .secrets
            .load_or_create_rsa(&req.uuid, &self.aes, self.rsa_bits)?;
        let cipher = codec
            .encrypt(req.key.as_bytes())
            .map_err(AdaptorError::crypto(&req.uuid))?;

        self.ledger
            .append_social_key(uuid_key(&req.uuid), vec![cipher])
            .await?;
        tracing::debug!(
            chain = self.chain,
            contract = ?self.contract,
            uuid = %req.uuid,
            "Appended social key",
        );
        self.secrets.add_key(&req.uuid, KeyRecord { secret: req.password.clone(), cid: None });

        Ok(SetSocialKeyRep {
            code: ReturnCode::Success,
            msg: "set social key success".into(),
            pub_key: record.rsa_pub,
            priv_key: record.rsa_priv_enc,
            file_cid: String::new(),
        })
    }
}
