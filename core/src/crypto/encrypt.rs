// Box encryption: sealed boxes for first contact, secret boxes for sessions
//
// Sealed box (anonymous, recipient-only confidentiality):
// 1. Convert recipient's Ed25519 public key → X25519
// 2. Generate ephemeral X25519 keypair
// 3. ECDH: ephemeral_secret × recipient_x25519_public → shared_secret
// 4. KDF: Blake3::derive_key(shared ‖ ephemeral_pub ‖ recipient_pub) → symmetric_key
// 5. Nonce: Blake3(ephemeral_pub ‖ recipient_pub)[..24]
// 6. Output: ephemeral_pub ‖ XChaCha20-Poly1305(symmetric_key, nonce, plaintext)
//
// Secret box (session traffic):
//   Output: random_nonce ‖ XChaCha20-Poly1305(session_key, nonce, plaintext)
//
// Session keys: X25519 over the converted identity keys, expanded with Blake3
// into (client_rx, client_tx). The side with the smaller X25519 public key is
// the client, so both ends agree on roles without negotiation.

use super::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// XChaCha20 nonce length.
pub const NONCE_BYTES: usize = 24;
/// Poly1305 tag length.
pub const MAC_BYTES: usize = 16;

const EPHEMERAL_KEY_BYTES: usize = 32;

/// KDF context strings. Changing these breaks compatibility with all peers.
const SEAL_CONTEXT: &str = "pairwire 2026-01-12 sealed box";
const KX_CONTEXT: &str = "pairwire 2026-01-12 session key exchange";

/// Convert an Ed25519 signing key to an X25519 static secret for ECDH.
///
/// The Ed25519 secret scalar is SHA-512(secret_key_bytes)[0..32], clamped;
/// `StaticSecret` clamps on use, so the raw half is passed through.
fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Convert an Ed25519 verifying (public) key to an X25519 public key.
///
/// Birational map from twisted Edwards to Montgomery: u = (1 + y) / (1 - y).
fn ed25519_public_to_x25519(public_key_bytes: &[u8; 32]) -> Result<X25519PublicKey, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(public_key_bytes)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    let edwards_point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidPublicKey("not a curve point".to_string()))?;

    Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}

fn seal_nonce(ephemeral_public: &[u8; 32], recipient_public: &[u8; 32]) -> [u8; NONCE_BYTES] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ephemeral_public);
    hasher.update(recipient_public);
    let digest = hasher.finalize();

    let mut nonce = [0u8; NONCE_BYTES];
    nonce.copy_from_slice(&digest.as_bytes()[..NONCE_BYTES]);
    nonce
}

fn seal_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(SEAL_CONTEXT);
    hasher.update(shared_secret);
    hasher.update(ephemeral_public);
    hasher.update(recipient_public);
    *hasher.finalize().as_bytes()
}

/// Encrypt a message so that only the holder of `recipient_public_key` can read it.
///
/// The sender stays anonymous; use this only for first contact, where the
/// payload itself names the sender.
pub fn seal(plaintext: &[u8], recipient_public_key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let recipient_x25519 = ed25519_public_to_x25519(recipient_public_key)?;

    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_x25519);
    if !shared_secret.was_contributory() {
        return Err(CryptoError::InvalidPublicKey("low order point".to_string()));
    }

    let mut symmetric_key = seal_key(
        shared_secret.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_x25519.as_bytes(),
    );
    let nonce = seal_nonce(ephemeral_public.as_bytes(), recipient_x25519.as_bytes());

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    symmetric_key.zeroize();

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(EPHEMERAL_KEY_BYTES + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed box with our own identity key.
///
/// Any failure (short input, wrong recipient, tampering) is `DecryptionFailed`.
pub fn open_sealed(sealed: &[u8], recipient: &SigningKey) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < EPHEMERAL_KEY_BYTES + MAC_BYTES {
        return Err(CryptoError::DecryptionFailed);
    }

    let recipient_secret = ed25519_to_x25519_secret(recipient);
    let recipient_public = X25519PublicKey::from(&recipient_secret);

    let mut ephemeral_bytes = [0u8; EPHEMERAL_KEY_BYTES];
    ephemeral_bytes.copy_from_slice(&sealed[..EPHEMERAL_KEY_BYTES]);
    let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);

    let shared_secret = recipient_secret.diffie_hellman(&ephemeral_public);
    if !shared_secret.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut symmetric_key = seal_key(
        shared_secret.as_bytes(),
        &ephemeral_bytes,
        recipient_public.as_bytes(),
    );
    let nonce = seal_nonce(&ephemeral_bytes, recipient_public.as_bytes());

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    symmetric_key.zeroize();

    cipher
        .decrypt(XNonce::from_slice(&nonce), &sealed[EPHEMERAL_KEY_BYTES..])
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// `seal` for text payloads; output is hex.
pub fn seal_hex(message: &str, recipient_public_key: &[u8; 32]) -> Result<String, CryptoError> {
    Ok(hex::encode(seal(message.as_bytes(), recipient_public_key)?))
}

/// `open_sealed` for hex payloads carrying UTF-8 text.
pub fn open_sealed_hex(payload_hex: &str, recipient: &SigningKey) -> Result<String, CryptoError> {
    let sealed = hex::decode(payload_hex).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let plaintext = open_sealed(&sealed, recipient)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Directional symmetric keys between us and one peer. Never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub receive_key: [u8; 32],
    pub transmit_key: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}

/// Derive the session keys between our identity and a peer's public key.
///
/// For identities A and B: `derive(A, B).transmit_key == derive(B, A).receive_key`
/// and vice versa.
pub fn derive_session_keys(
    own: &SigningKey,
    peer_public_key: &[u8; 32],
) -> Result<SessionKeys, CryptoError> {
    let own_secret = ed25519_to_x25519_secret(own);
    let own_public = X25519PublicKey::from(&own_secret);
    let peer_public = ed25519_public_to_x25519(peer_public_key)?;

    let shared_secret = own_secret.diffie_hellman(&peer_public);
    if !shared_secret.was_contributory() {
        return Err(CryptoError::InvalidPublicKey("low order point".to_string()));
    }

    let is_client = own_public.as_bytes() <= peer_public.as_bytes();
    let (client_public, server_public) = if is_client {
        (own_public.as_bytes(), peer_public.as_bytes())
    } else {
        (peer_public.as_bytes(), own_public.as_bytes())
    };

    let mut hasher = blake3::Hasher::new_derive_key(KX_CONTEXT);
    hasher.update(shared_secret.as_bytes());
    hasher.update(client_public);
    hasher.update(server_public);
    let mut okm = [0u8; 64];
    hasher.finalize_xof().fill(&mut okm);

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    okm.zeroize();

    let keys = if is_client {
        SessionKeys {
            receive_key: first,
            transmit_key: second,
        }
    } else {
        SessionKeys {
            receive_key: second,
            transmit_key: first,
        }
    };
    first.zeroize();
    second.zeroize();

    Ok(keys)
}

/// Authenticated symmetric encryption with a fresh random nonce prepended.
pub fn encrypt_with_key(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut payload = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Inverse of `encrypt_with_key`.
pub fn decrypt_with_key(payload: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < NONCE_BYTES + MAC_BYTES {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce, ciphertext) = payload.split_at(NONCE_BYTES);
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// `encrypt_with_key` for text payloads; output is hex.
pub fn encrypt_payload(message: &str, key: &[u8; 32]) -> Result<String, CryptoError> {
    Ok(hex::encode(encrypt_with_key(message.as_bytes(), key)?))
}

/// `decrypt_with_key` for hex payloads carrying UTF-8 text.
pub fn decrypt_payload(payload_hex: &str, key: &[u8; 32]) -> Result<String, CryptoError> {
    let payload = hex::decode(payload_hex).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let plaintext = decrypt_with_key(&payload, key)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeys;
    use proptest::prelude::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let recipient = IdentityKeys::generate();
        let sealed = seal(b"pairing response", &recipient.public_key()).unwrap();

        let opened = open_sealed(&sealed, &recipient.signing_key).unwrap();
        assert_eq!(opened, b"pairing response");
    }

    #[test]
    fn test_seal_wrong_recipient_fails() {
        let recipient = IdentityKeys::generate();
        let other = IdentityKeys::generate();
        let sealed = seal(b"secret", &recipient.public_key()).unwrap();

        assert_eq!(
            open_sealed(&sealed, &other.signing_key),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_seal_is_randomized() {
        let recipient = IdentityKeys::generate();
        let a = seal(b"same", &recipient.public_key()).unwrap();
        let b = seal(b"same", &recipient.public_key()).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_open_short_input_is_decryption_failure() {
        let recipient = IdentityKeys::generate();

        assert_eq!(
            open_sealed(&[0u8; 20], &recipient.signing_key),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_open_sealed_hex_rejects_non_hex_as_encoding_error() {
        let recipient = IdentityKeys::generate();

        assert!(matches!(
            open_sealed_hex("zz-not-hex", &recipient.signing_key),
            Err(CryptoError::Encoding(_))
        ));
    }

    #[test]
    fn test_session_keys_are_symmetric() {
        let a = IdentityKeys::generate();
        let b = IdentityKeys::generate();

        let ab = derive_session_keys(&a.signing_key, &b.public_key()).unwrap();
        let ba = derive_session_keys(&b.signing_key, &a.public_key()).unwrap();

        assert_eq!(ab.transmit_key, ba.receive_key);
        assert_eq!(ab.receive_key, ba.transmit_key);
        assert_ne!(ab.transmit_key, ab.receive_key);
    }

    #[test]
    fn test_session_keys_differ_per_peer() {
        let a = IdentityKeys::generate();
        let b = IdentityKeys::generate();
        let c = IdentityKeys::generate();

        let ab = derive_session_keys(&a.signing_key, &b.public_key()).unwrap();
        let ac = derive_session_keys(&a.signing_key, &c.public_key()).unwrap();

        assert_ne!(ab.transmit_key, ac.transmit_key);
    }

    #[test]
    fn test_session_keys_reject_invalid_peer_key() {
        let a = IdentityKeys::generate();
        // y = 2 does not decompress to a curve point
        let mut bogus = [0u8; 32];
        bogus[0] = 2;

        assert!(derive_session_keys(&a.signing_key, &bogus).is_err());
    }

    #[test]
    fn test_secret_box_roundtrip_and_fresh_nonce() {
        let key = [7u8; 32];
        let a = encrypt_payload("hello", &key).unwrap();
        let b = encrypt_payload("hello", &key).unwrap();

        assert_ne!(a, b);
        assert_eq!(decrypt_payload(&a, &key).unwrap(), "hello");
        assert_eq!(decrypt_payload(&b, &key).unwrap(), "hello");
    }

    #[test]
    fn test_secret_box_wrong_key_fails() {
        let payload = encrypt_with_key(b"hello", &[1u8; 32]).unwrap();

        assert_eq!(
            decrypt_with_key(&payload, &[2u8; 32]),
            Err(CryptoError::DecryptionFailed)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_secret_box_roundtrip(message in proptest::collection::vec(any::<u8>(), 0..512)) {
            let key = [9u8; 32];
            let payload = encrypt_with_key(&message, &key).unwrap();
            prop_assert_eq!(decrypt_with_key(&payload, &key).unwrap(), message);
        }

        #[test]
        fn prop_secret_box_tamper_detected(
            message in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let key = [3u8; 32];
            let mut payload = encrypt_with_key(&message, &key).unwrap();
            let i = index.index(payload.len());
            payload[i] ^= flip;
            prop_assert_eq!(decrypt_with_key(&payload, &key), Err(CryptoError::DecryptionFailed));
        }

        #[test]
        fn prop_sealed_tamper_detected(
            message in proptest::collection::vec(any::<u8>(), 1..128),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let recipient = IdentityKeys::from_seed("proptest recipient");
            let mut sealed = seal(&message, &recipient.public_key()).unwrap();
            let i = index.index(sealed.len());
            sealed[i] ^= flip;
            prop_assert_eq!(
                open_sealed(&sealed, &recipient.signing_key),
                Err(CryptoError::DecryptionFailed)
            );
        }

        #[test]
        fn prop_sealed_roundtrip(message in proptest::collection::vec(any::<u8>(), 0..256)) {
            let recipient = IdentityKeys::from_seed("proptest recipient");
            let sealed = seal(&message, &recipient.public_key()).unwrap();
            prop_assert_eq!(open_sealed(&sealed, &recipient.signing_key).unwrap(), message);
        }
    }
}
