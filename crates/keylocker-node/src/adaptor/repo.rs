use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use keylocker_crypto::{RsaCodec, RsaKeyPair, SymmetricKey};

use super::AdaptorError;

/// Per-identity RSA keypair. The private half is AES encrypted then base64
/// encoded; it is never stored in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub rsa_pub: String,
    pub rsa_priv_enc: String,
}

/// One stored social key. `cid` is set only by content-addressed backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub secret: String,
    pub cid: Option<String>,
}

/// In-memory secret store shared by every adaptor of a node, keyed by uuid.
#[derive(Default)]
pub struct SecretRepo {
    secrets: RwLock<HashMap<String, SecretRecord>>,
    keys: RwLock<HashMap<String, Vec<KeyRecord>>>,
}

impl SecretRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_secret(&self, uuid: &str) -> Option<SecretRecord> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned()
    }

    /// Insert unless a record already exists; returns the record now stored.
    pub fn insert_secret(&self, uuid: &str, record: SecretRecord) -> SecretRecord {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uuid.to_string())
            .or_insert(record)
            .clone()
    }

    pub fn add_key(&self, uuid: &str, record: KeyRecord) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uuid.to_string())
            .or_default()
            .push(record);
    }

    pub fn keys(&self, uuid: &str) -> Vec<KeyRecord> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Load the RSA codec for `uuid`. A missing record is a key miss on `chain`.
    pub fn load_rsa(
        &self,
        chain: &str,
        uuid: &str,
        aes: &SymmetricKey,
    ) -> Result<RsaCodec, AdaptorError> {
        let record = self.get_secret(uuid).ok_or_else(|| AdaptorError::KeyNotFound {
            chain: chain.to_string(),
            uuid: uuid.to_string(),
        })?;
        codec_for(uuid, &record, aes)
    }

    /// Load the RSA codec for `uuid`, generating and storing a new keypair on
    /// first use.
    pub fn load_or_create_rsa(
        &self,
        uuid: &str,
        aes: &SymmetricKey,
        bits: usize,
    ) -> Result<(RsaCodec, SecretRecord), AdaptorError> {
        if let Some(record) = self.get_secret(uuid) {
            let codec = codec_for(uuid, &record, aes)?;
            return Ok((codec, record));
        }

        let pair = RsaKeyPair::generate(bits).map_err(AdaptorError::crypto(uuid))?;
        let fresh = SecretRecord {
            rsa_pub: pair.public_pem,
            rsa_priv_enc: aes.encrypt_b64(pair.private_pem.as_bytes()),
        };
        // A concurrent set for the same uuid may have won the insert.
        let record = self.insert_secret(uuid, fresh);
        tracing::debug!(uuid, "Generated RSA keypair");
        let codec = codec_for(uuid, &record, aes)?;
        Ok((codec, record))
    }
}

fn codec_for(uuid: &str, record: &SecretRecord, aes: &SymmetricKey) -> Result<RsaCodec, AdaptorError> {
    let private = aes
        .decrypt_b64(&record.rsa_priv_enc)
        .map_err(AdaptorError::crypto(uuid))?;
    let private = String::from_utf8(private)
        .map_err(|_| AdaptorError::Backend(format!("stored private key for {uuid} is not UTF-8")))?;
    RsaCodec::from_pem(&record.rsa_pub, &private).map_err(AdaptorError::crypto(uuid))
}
