use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid symmetric key length {0}: expected 16 or 32 bytes")]
    InvalidKeyLength(usize),

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("bad padding or corrupted ciphertext")]
    BadPadding,

    #[error("rsa key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid PEM key: {0}")]
    InvalidPem(String),

    #[error("no {0} key loaded")]
    MissingKey(&'static str),

    #[error("rsa encrypt failed: {0}")]
    Encrypt(String),

    #[error("rsa decrypt failed: {0}")]
    Decrypt(String),

    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
}
