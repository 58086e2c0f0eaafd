// Identity key management
//
// The long-term identity is an Ed25519 keypair. Its public key is the stable
// participant identifier; everything else (relay user id, sender id,
// addresses) is derived from it.

use super::{hash, hash_to, CryptoError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::{Zeroize, Zeroizing};

/// Width of the login time bucket in seconds.
pub const LOGIN_BUCKET_SECS: u64 = 5 * 60;

/// Identity keys of one transport instance.
#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate new random identity keys
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    /// Deterministically derive identity keys from a seed.
    ///
    /// Same seed, same keypair. This gives reproducible identities across
    /// sessions; the seed itself is the secret.
    pub fn from_seed(seed: &str) -> Self {
        let mut secret_key_bytes = hash(seed.as_bytes());
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Hex hash of the public key; the local part of our relay user id.
    pub fn public_key_hash(&self) -> String {
        super::hex_hash(&self.public_key())
    }

    pub fn sender_id(&self) -> String {
        sender_id(&self.public_key())
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Verify signature
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
        let public_key: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey("expected 32 bytes".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;

        Ok(verifying_key
            .verify(data, &Signature::from_bytes(&signature))
            .is_ok())
    }

    /// Serialize keys to bytes; wiped on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    /// Deserialize keys from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::Encoding("invalid key length".to_string()))?;
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Ok(Self { signing_key })
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a hex encoded 32-byte Ed25519 public key.
pub fn parse_public_key(public_key_hex: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(public_key_hex.trim_start_matches("0x"))
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey("expected 32 bytes".to_string()))
}

/// Short correlation id of a public key: base58check of the first 5 hash bytes.
pub fn sender_id(public_key: &[u8; 32]) -> String {
    let short: [u8; 5] = hash_to(public_key);
    bs58::encode(short).with_check().into_string()
}

fn login_digest(bucket: u64) -> [u8; 32] {
    hash(format!("login:{}", bucket).as_bytes())
}

/// Relay login password: `ed:<hex signature over time bucket>:<hex public key>`.
pub fn login_password(keys: &IdentityKeys, unix_secs: u64) -> String {
    let digest = login_digest(unix_secs / LOGIN_BUCKET_SECS);
    format!(
        "ed:{}:{}",
        hex::encode(keys.sign(&digest)),
        keys.public_key_hex()
    )
}

/// Check a login password against the current or the previous time bucket.
///
/// Returns the public key that produced it.
pub fn verify_login_password(password: &str, unix_secs: u64) -> Result<[u8; 32], CryptoError> {
    let mut parts = password.splitn(3, ':');
    let (Some("ed"), Some(signature_hex), Some(public_key_hex)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(CryptoError::Encoding("malformed login password".to_string()));
    };

    let signature =
        hex::decode(signature_hex).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let public_key = parse_public_key(public_key_hex)?;
    let bucket = unix_secs / LOGIN_BUCKET_SECS;

    for candidate in [bucket, bucket.saturating_sub(1)] {
        if IdentityKeys::verify(&login_digest(candidate), &signature, &public_key)? {
            return Ok(public_key);
        }
    }

    Err(CryptoError::InvalidSignature)
}
