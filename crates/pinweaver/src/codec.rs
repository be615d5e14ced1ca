//! leaf codec: wrap, unwrap and authenticate leaves
//!
//! the tag is checked in constant time before anything is decrypted, and a
//! failed check is always reported as the same error.

use tracing::warn;
use zeroize::Zeroizing;

use crate::crypto::{self, Hash, HASH_SIZE, WRAP_IV_SIZE};
use crate::keys::TreeKeys;
use crate::leaf::{
    LeafData, LeafHeader, LeafPublicData, LeafSensitiveData, WrappedLeaf, LEAF_MAJOR_VERSION,
    LEAF_MINOR_VERSION, PUBLIC_DATA_SIZE, PUBLIC_DATA_SIZE_V0, SENSITIVE_DATA_SIZE,
};
use crate::platform::Platform;
use crate::{Error, Result};

/// public section length a known minor version must carry
fn expected_public_len(minor: u16) -> Option<usize> {
    match minor {
        0 => Some(PUBLIC_DATA_SIZE_V0),
        LEAF_MINOR_VERSION => Some(PUBLIC_DATA_SIZE),
        _ => None,
    }
}

/// check a leaf header against the bytes that follow the fixed prefix
///
/// `payload_len` counts the public and cipher sections plus the path hashes.
pub fn validate_leaf_header(
    header: &LeafHeader,
    payload_len: usize,
    aux_hash_count: usize,
) -> Result<()> {
    if header.major != LEAF_MAJOR_VERSION {
        return Err(Error::LeafVersionMismatch);
    }

    let pub_len = header.pub_len as usize;
    let sec_len = header.sec_len as usize;
    match expected_public_len(header.minor) {
        Some(expected) => {
            if pub_len != expected || sec_len != SENSITIVE_DATA_SIZE {
                return Err(Error::LengthInvalid);
            }
        }
        None if header.minor > LEAF_MINOR_VERSION => {
            // newer minors only append, so they must cover the current layout
            if pub_len < PUBLIC_DATA_SIZE || sec_len < SENSITIVE_DATA_SIZE {
                return Err(Error::LengthInvalid);
            }
        }
        None => return Err(Error::LengthInvalid),
    }

    if payload_len != header.payload_len() + aux_hash_count * HASH_SIZE {
        return Err(Error::LengthInvalid);
    }
    Ok(())
}

/// hmac over header, iv, public and cipher sections
pub fn compute_hmac(keys: &TreeKeys, leaf: &WrappedLeaf) -> Result<Hash> {
    crypto::mac(
        &keys.hmac_key,
        &[
            &leaf.header.to_bytes()[..],
            &leaf.iv[..],
            &leaf.public[..],
            &leaf.cipher_text[..],
        ],
    )
}

/// constant-time check of the leaf's tag
pub fn verify_hmac(keys: &TreeKeys, leaf: &WrappedLeaf) -> Result<()> {
    let expected = compute_hmac(keys, leaf)?;
    if !crypto::ct_eq(&expected, &leaf.hmac) {
        return Err(Error::HmacAuthFailed);
    }
    Ok(())
}

/// wrap a new leaf under a fresh random iv
pub fn encrypt_leaf<P: Platform + ?Sized>(
    platform: &P,
    keys: &TreeKeys,
    leaf: &LeafData,
) -> Result<WrappedLeaf> {
    let mut iv = [0u8; WRAP_IV_SIZE];
    platform.fill_random(&mut iv);

    let mut cipher_text = leaf.sensitive.to_bytes();
    crypto::apply_keystream(&keys.wrap_key, &iv, cipher_text.as_mut_slice())?;

    let mut wrapped = WrappedLeaf {
        header: LeafHeader::current(),
        hmac: [0u8; HASH_SIZE],
        iv,
        public: leaf.public.to_bytes(),
        cipher_text: cipher_text.to_vec(),
    };
    wrapped.hmac = compute_hmac(keys, &wrapped)?;
    Ok(wrapped)
}

/// decrypt a leaf whose tag has already been verified
pub fn decrypt_leaf(keys: &TreeKeys, wrapped: &WrappedLeaf) -> Result<LeafData> {
    if wrapped.cipher_text.len() < SENSITIVE_DATA_SIZE {
        return Err(Error::LengthInvalid);
    }

    let public = LeafPublicData::from_prefix(&wrapped.public)?;

    let mut plain = Zeroizing::new([0u8; SENSITIVE_DATA_SIZE]);
    plain.copy_from_slice(&wrapped.cipher_text[..SENSITIVE_DATA_SIZE]);
    crypto::apply_keystream(&keys.wrap_key, &wrapped.iv, plain.as_mut_slice())?;
    let sensitive = LeafSensitiveData::from_bytes(&plain);

    Ok(LeafData { public, sensitive })
}

/// rewrite the public fields of a leaf, keeping its iv and cipher text
///
/// the result always carries the current header; fields appended by a
/// newer minor version are dropped.
pub fn rewrap_leaf(
    keys: &TreeKeys,
    public: &LeafPublicData,
    old: &WrappedLeaf,
) -> Result<WrappedLeaf> {
    if old.cipher_text.len() < SENSITIVE_DATA_SIZE {
        return Err(Error::LengthInvalid);
    }
    if old.header.minor > LEAF_MINOR_VERSION {
        warn!(
            "downgrading leaf {} from minor version {} to {}",
            public.label, old.header.minor, LEAF_MINOR_VERSION
        );
    }

    let mut wrapped = WrappedLeaf {
        header: LeafHeader::current(),
        hmac: [0u8; HASH_SIZE],
        iv: old.iv,
        public: public.to_bytes(),
        cipher_text: old.cipher_text[..SENSITIVE_DATA_SIZE].to_vec(),
    };
    wrapped.hmac = compute_hmac(keys, &wrapped)?;
    Ok(wrapped)
}
