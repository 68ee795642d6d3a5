use rand::rngs::OsRng;
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    traits::PublicKeyParts,
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
};

use crate::error::CryptoError;

/// PKCS#1 v1.5 padding overhead per encrypted block.
const PKCS1_OVERHEAD: usize = 11;

/// A freshly generated keypair in PEM form (PKIX public, PKCS#8 private).
#[derive(Debug, Clone)]
pub struct RsaKeyPair {
    pub public_pem: String,
    pub private_pem: String,
}

impl RsaKeyPair {
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public = RsaPublicKey::from(&private);

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?
            .to_string();
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        Ok(Self { public_pem, private_pem })
    }
}

/// Chunked RSA codec.
///
/// Plaintext is split into blocks of `key_size - 11` bytes, each encrypted
/// independently and concatenated. Decryption walks the ciphertext in
/// `key_size` blocks. Either half of the key may be absent; the matching
/// operation then fails with `MissingKey`.
#[derive(Debug, Clone, Default)]
pub struct RsaCodec {
    public: Option<RsaPublicKey>,
    private: Option<RsaPrivateKey>,
}

impl RsaCodec {
    /// Load from PEM strings. Empty strings leave that half unset.
    /// The private key may be PKCS#8 or PKCS#1 ("BEGIN RSA PRIVATE KEY").
    pub fn from_pem(public_pem: &str, private_pem: &str) -> Result<Self, CryptoError> {
        let private = if private_pem.is_empty() {
            None
        } else if private_pem.contains("BEGIN RSA") {
            Some(
                RsaPrivateKey::from_pkcs1_pem(private_pem)
                    .map_err(|e| CryptoError::InvalidPem(e.to_string()))?,
            )
        } else {
            Some(
                RsaPrivateKey::from_pkcs8_pem(private_pem)
                    .map_err(|e| CryptoError::InvalidPem(e.to_string()))?,
            )
        };

        let public = if public_pem.is_empty() {
            private.as_ref().map(RsaPublicKey::from)
        } else {
            Some(
                RsaPublicKey::from_public_key_pem(public_pem)
                    .map_err(|e| CryptoError::InvalidPem(e.to_string()))?,
            )
        };

        Ok(Self { public, private })
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.public.as_ref().ok_or(CryptoError::MissingKey("public"))?;
        let block = key.size() - PKCS1_OVERHEAD;

        let mut out = Vec::with_capacity((data.len() / block + 1) * key.size());
        if data.is_empty() {
            out.extend(encrypt_block(key, data)?);
            return Ok(out);
        }
        for chunk in data.chunks(block) {
            out.extend(encrypt_block(key, chunk)?);
        }
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.private.as_ref().ok_or(CryptoError::MissingKey("private"))?;
        let block = key.size();

        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(block) {
            let plain = key
                .decrypt(Pkcs1v15Encrypt, chunk)
                .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
            out.extend(plain);
        }
        Ok(out)
    }

    /// Modulus size in bytes, if any key half is loaded.
    pub fn key_size(&self) -> Option<usize> {
        self.public
            .as_ref()
            .map(|k| k.size())
            .or_else(|| self.private.as_ref().map(|k| k.size()))
    }
}

fn encrypt_block(key: &RsaPublicKey, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, chunk)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))
}
