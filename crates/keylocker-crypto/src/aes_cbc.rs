use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};

use crate::error::CryptoError;

const IV_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Fixed-length AES key. Ciphertexts are `iv || AES-CBC(PKCS#7(plaintext))`
/// with a fresh random IV per call.
#[derive(Clone, PartialEq, Eq)]
pub enum SymmetricKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aes128(_) => write!(f, "SymmetricKey::Aes128(..)"),
            Self::Aes256(_) => write!(f, "SymmetricKey::Aes256(..)"),
        }
    }
}

impl SymmetricKey {
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        match key.len() {
            16 => {
                let mut k = [0u8; 16];
                k.copy_from_slice(key);
                Ok(Self::Aes128(k))
            }
            32 => {
                let mut k = [0u8; 32];
                k.copy_from_slice(key);
                Ok(Self::Aes256(k))
            }
            n => Err(CryptoError::InvalidKeyLength(n)),
        }
    }

    /// Random AES-256 key.
    pub fn generate() -> Self {
        let mut k = [0u8; 32];
        OsRng.fill_bytes(&mut k);
        Self::Aes256(k)
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ct = match self {
            Self::Aes128(k) => {
                Aes128CbcEnc::new(k.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
            }
            Self::Aes256(k) => {
                Aes256CbcEnc::new(k.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
            }
        };

        let mut out = Vec::with_capacity(IV_LEN + ct.len());
        out.extend_from_slice(&iv);
        out.extend(ct);
        out
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < IV_LEN * 2 || data.len() % IV_LEN != 0 {
            return Err(CryptoError::CiphertextTooShort(data.len()));
        }
        let (iv, ct) = data.split_at(IV_LEN);
        let mut iv_arr = [0u8; IV_LEN];
        iv_arr.copy_from_slice(iv);

        match self {
            Self::Aes128(k) => Aes128CbcDec::new(k.into(), &iv_arr.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ct),
            Self::Aes256(k) => Aes256CbcDec::new(k.into(), &iv_arr.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ct),
        }
        .map_err(|_| CryptoError::BadPadding)
    }

    /// Encrypt and base64 encode, the storage form for private keys.
    pub fn encrypt_b64(&self, data: &[u8]) -> String {
        STANDARD.encode(self.encrypt(data))
    }

    pub fn decrypt_b64(&self, data: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = STANDARD.decode(data)?;
        self.decrypt(&raw)
    }
}
