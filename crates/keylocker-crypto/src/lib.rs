//! Codec primitives consumed by the chain adaptors.
//!
//! Pure functions over byte slices: chunked RSA PKCS#1 v1.5 and AES-CBC with
//! PKCS#7 padding. Nothing here holds state beyond the key material passed in.

pub mod aes_cbc;
pub mod chunked_rsa;
pub mod error;

pub use aes_cbc::SymmetricKey;
pub use chunked_rsa::{RsaCodec, RsaKeyPair};
pub use error::CryptoError;
