// Cryptography module: identity keys, sealed and secret boxes, session keys, addresses

pub mod address;
pub mod encrypt;
pub mod keys;

pub use address::{address_from_public_key, encode_public_key, validate_address, AddressKind};
pub use encrypt::{
    decrypt_payload, decrypt_with_key, derive_session_keys, encrypt_payload, encrypt_with_key,
    open_sealed, open_sealed_hex, seal, seal_hex, SessionKeys, MAC_BYTES, NONCE_BYTES,
};
pub use keys::{
    login_password, parse_public_key, sender_id, verify_login_password, IdentityKeys,
    LOGIN_BUCKET_SECS,
};

use thiserror::Error;

/// Errors raised by the crypto primitives.
///
/// `DecryptionFailed` is the "not addressed to me" outcome: callers that try
/// several candidate keys must swallow it and move on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// 32-byte Blake3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex encoded 32-byte digest, used for relay user ids and host selection.
pub fn hex_hash(data: &[u8]) -> String {
    hex::encode(hash(data))
}

/// Variable-length digest (Blake3 XOF), used where a short hash is needed.
pub fn hash_to<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Random 128-bit correlation id in 8-4-4-4-12 hex form.
pub fn guid() -> String {
    uuid::Uuid::new_v4().hyphenated().to_string()
}

/// Relay user id of a participant: `@<hash>:<host>`.
pub fn recipient_string(recipient_hash: &str, relay_server: &str) -> String {
    format!("@{}:{}", recipient_hash, relay_server)
}
