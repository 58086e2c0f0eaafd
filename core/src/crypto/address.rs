// Account addresses
//
// address = base58check(curve_prefix ‖ hash20(raw_public_key))

use super::{hash_to, CryptoError};

const ADDRESS_HASH_BYTES: usize = 20;

/// Curve family of an encoded public key, and of the address derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// `edpk…` keys, `tz1…` addresses
    Ed25519,
    /// `sppk…` keys, `tz2…` addresses
    Secp256k1,
    /// `p2pk…` keys, `tz3…` addresses
    P256,
}

impl AddressKind {
    const ALL: [AddressKind; 3] = [AddressKind::Ed25519, AddressKind::Secp256k1, AddressKind::P256];

    fn key_tag(self) -> &'static str {
        match self {
            AddressKind::Ed25519 => "edpk",
            AddressKind::Secp256k1 => "sppk",
            AddressKind::P256 => "p2pk",
        }
    }

    fn key_prefix(self) -> [u8; 4] {
        match self {
            AddressKind::Ed25519 => [13, 15, 37, 217],
            AddressKind::Secp256k1 => [3, 254, 226, 86],
            AddressKind::P256 => [3, 178, 139, 127],
        }
    }

    /// Length of the base58check encoded key, tag included.
    fn encoded_key_len(self) -> usize {
        match self {
            AddressKind::Ed25519 => 54,
            AddressKind::Secp256k1 | AddressKind::P256 => 55,
        }
    }

    fn address_prefix(self) -> [u8; 3] {
        match self {
            AddressKind::Ed25519 => [6, 161, 159],
            AddressKind::Secp256k1 => [6, 161, 161],
            AddressKind::P256 => [6, 161, 164],
        }
    }
}

/// Base58check encoding of a raw Ed25519 public key (`edpk…`).
pub fn encode_public_key(public_key: &[u8; 32]) -> String {
    let mut payload = AddressKind::Ed25519.key_prefix().to_vec();
    payload.extend_from_slice(public_key);
    bs58::encode(payload).with_check().into_string()
}

fn decode_public_key(public_key: &str) -> Result<(AddressKind, Vec<u8>), CryptoError> {
    if public_key.len() == 64 {
        let raw = hex::decode(public_key).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        return Ok((AddressKind::Ed25519, raw));
    }

    let kind = AddressKind::ALL
        .into_iter()
        .find(|kind| public_key.starts_with(kind.key_tag()) && public_key.len() == kind.encoded_key_len())
        .ok_or_else(|| CryptoError::InvalidPublicKey(public_key.to_string()))?;

    let decoded = bs58::decode(public_key)
        .with_check(None)
        .into_vec()
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    let prefix = kind.key_prefix();
    if !decoded.starts_with(&prefix) {
        return Err(CryptoError::InvalidPublicKey(public_key.to_string()));
    }

    Ok((kind, decoded[prefix.len()..].to_vec()))
}

/// Derive the account address of a public key.
///
/// Accepts a 64 char hex Ed25519 key or a base58check `edpk`/`sppk`/`p2pk` key.
pub fn address_from_public_key(public_key: &str) -> Result<String, CryptoError> {
    let (kind, raw) = decode_public_key(public_key)?;
    let digest: [u8; ADDRESS_HASH_BYTES] = hash_to(&raw);

    let mut payload = kind.address_prefix().to_vec();
    payload.extend_from_slice(&digest);
    Ok(bs58::encode(payload).with_check().into_string())
}

/// Checksum and prefix validation of an address. Returns its curve family.
pub fn validate_address(address: &str) -> Result<AddressKind, CryptoError> {
    let decoded = bs58::decode(address)
        .with_check(None)
        .into_vec()
        .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;

    if decoded.len() != 3 + ADDRESS_HASH_BYTES {
        return Err(CryptoError::InvalidAddress(format!(
            "unexpected length {}",
            decoded.len()
        )));
    }

    AddressKind::ALL
        .into_iter()
        .find(|kind| decoded.starts_with(&kind.address_prefix()))
        .ok_or_else(|| CryptoError::InvalidAddress("unknown prefix".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeys;

    #[test]
    fn test_address_is_deterministic_and_valid() {
        let keys = IdentityKeys::from_seed("address");
        let a = address_from_public_key(&keys.public_key_hex()).unwrap();
        let b = address_from_public_key(&keys.public_key_hex()).unwrap();

        assert_eq!(a, b);
        assert!(a.starts_with("tz1"));
        assert_eq!(validate_address(&a).unwrap(), AddressKind::Ed25519);
    }

    #[test]
    fn test_hex_and_edpk_forms_agree() {
        let keys = IdentityKeys::generate();
        let edpk = encode_public_key(&keys.public_key());

        assert!(edpk.starts_with("edpk"));
        assert_eq!(edpk.len(), 54);
        assert_eq!(
            address_from_public_key(&edpk).unwrap(),
            address_from_public_key(&keys.public_key_hex()).unwrap()
        );
    }

    #[test]
    fn test_secp256k1_key_yields_tz2() {
        let mut payload = AddressKind::Secp256k1.key_prefix().to_vec();
        payload.extend_from_slice(&[2u8; 33]);
        let sppk = bs58::encode(payload).with_check().into_string();

        assert!(sppk.starts_with("sppk"));
        let address = address_from_public_key(&sppk).unwrap();
        assert!(address.starts_with("tz2"));
        assert_eq!(validate_address(&address).unwrap(), AddressKind::Secp256k1);
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(address_from_public_key("").is_err());
        assert!(address_from_public_key("edpk123").is_err());
        assert!(address_from_public_key(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_mutated_address_fails_checksum() {
        let keys = IdentityKeys::from_seed("mutate");
        let address = address_from_public_key(&keys.public_key_hex()).unwrap();

        for index in 0..address.len() {
            let mut chars: Vec<char> = address.chars().collect();
            chars[index] = if chars[index] == 'a' { 'b' } else { 'a' };
            let mutated: String = chars.into_iter().collect();
            assert!(validate_address(&mutated).is_err(), "index {} accepted", index);
        }
    }
}
