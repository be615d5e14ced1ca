//! cryptographic primitives for pinweaver
//!
//! - sha256 for merkle nodes
//! - hmac-sha256 for leaf authentication
//! - chacha20 keystream for the sensitive part of a leaf
//! - constant-time comparison for anything secret or attacker supplied

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// digest size used for every node, tag and pcr digest
pub const HASH_SIZE: usize = 32;

/// nonce size for leaf encryption
pub const WRAP_IV_SIZE: usize = 12;

pub type Hash = [u8; HASH_SIZE];

/// sha256 over the concatenation of `data`
pub fn sha256(data: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for d in data {
        hasher.update(d);
    }
    hasher.finalize().into()
}

/// compute hmac-sha256 tag over the concatenation of `data`
pub fn mac(key: &[u8], data: &[&[u8]]) -> Result<Hash> {
    let mut h = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| Error::CryptoFailure)?;
    for d in data {
        h.update(d);
    }
    Ok(h.finalize().into_bytes().into())
}

/// xor the chacha20 keystream for (key, iv) into `data`
///
/// encryption and decryption are the same operation.
pub fn apply_keystream(key: &[u8; 32], iv: &[u8; WRAP_IV_SIZE], data: &mut [u8]) -> Result<()> {
    let mut cipher = ChaCha20::new(Key::from_slice(key), Nonce::from_slice(iv));
    cipher
        .try_apply_keystream(data)
        .map_err(|_| Error::CryptoFailure)
}

/// constant-time equality for equal length slices
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// hex serialization helper for serde
pub(crate) mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{Hash, HASH_SIZE};

    pub fn serialize<S>(bytes: &Hash, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Hash, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", HASH_SIZE)))
    }
}
