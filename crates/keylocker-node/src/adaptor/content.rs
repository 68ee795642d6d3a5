use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use keylocker_crypto::SymmetricKey;
use keylocker_protocol::keylocker::{
    GetSocialKeyRep, GetSocialKeyReq, ReturnCode, SetSocialKeyRep, SetSocialKeyReq, SocialKey,
    SupportChainRep, SupportChainReq,
};
use sha2::{Digest, Sha256};

use super::{
    repo::{KeyRecord, SecretRepo},
    require_uuid, AdaptorContext, AdaptorError, KeyAdaptor, IPFS,
};

/// Content-addressed blob store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its content id.
    async fn add(&self, data: Vec<u8>) -> Result<String, AdaptorError>;

    async fn get(&self, cid: &str) -> Result<Option<Vec<u8>>, AdaptorError>;
}

/// Content id: lower-case hex SHA-256 of the stored bytes.
pub fn content_id(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn add(&self, data: Vec<u8>) -> Result<String, AdaptorError> {
        let cid = content_id(&data);
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cid.clone(), data);
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Option<Vec<u8>>, AdaptorError> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cid)
            .cloned())
    }
}

/// Content-store adaptor. Each set stores one RSA-encrypted blob and returns
/// its content id; a get needs that id back.
pub struct ContentAdaptor {
    store: Arc<dyn ContentStore>,
    secrets: Arc<SecretRepo>,
    aes: SymmetricKey,
    rsa_bits: usize,
}

pub fn ipfs(ctx: &AdaptorContext) -> Result<Box<dyn KeyAdaptor>, AdaptorError> {
    Ok(Box::new(ContentAdaptor::new(ctx, Arc::new(MemoryContentStore::default()))))
}

impl ContentAdaptor {
    pub fn new(ctx: &AdaptorContext, store: Arc<dyn ContentStore>) -> Self {
        tracing::info!(nodes = ?ctx.ipfs_nodes, "Content store adaptor ready");
        Self {
            store,
            secrets: ctx.secrets.clone(),
            aes: ctx.aes.clone(),
            rsa_bits: ctx.rsa_bits,
        }
    }

    fn miss(&self, uuid: &str) -> AdaptorError {
        AdaptorError::KeyNotFound { chain: IPFS.to_string(), uuid: uuid.to_string() }
    }
}

#[async_trait]
impl KeyAdaptor for ContentAdaptor {
    fn chain(&self) -> &str {
        IPFS
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
        if req.file_cid.is_empty() {
            return Err(self.miss(&req.uuid));
        }

        let blob = self
            .store
            .get(&req.file_cid)
            .await?
            .ok_or_else(|| self.miss(&req.uuid))?;

        let codec = self.secrets.load_rsa(IPFS, &req.uuid, &self.aes)?;
        let plain = codec.decrypt(&blob).map_err(AdaptorError::crypto(&req.uuid))?;

        Ok(GetSocialKeyRep {
            code: ReturnCode::Success,
            msg: "get ipfs social key success".into(),
            key_list: vec![SocialKey {
                id: req.file_cid.clone(),
                key: String::from_utf8_lossy(&plain).into_owned(),
            }],
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

        let cid = self.store.add(cipher).await?;
        tracing::debug!(uuid = %req.uuid, cid = %cid, "Stored social key blob");
        self.secrets.add_key(
            &req.uuid,
            KeyRecord { secret: req.password.clone(), cid: Some(cid.clone()) },
        );

        Ok(SetSocialKeyRep {
            code: ReturnCode::Success,
            msg: "set ipfs social key success".into(),
            pub_key: record.rsa_pub,
            priv_key: record.rsa_priv_enc,
            file_cid: cid,
        })
    }
}
