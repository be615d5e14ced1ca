//! tree state and its persisted configuration record
//!
//! the record is immutable once written; only the root moves afterwards,
//! and the root is recovered from the newest replay log entry on load.

use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, HASH_SIZE};
use crate::keys::{TreeKeys, NONCE_SIZE};
use crate::merkle;
use crate::platform::Platform;
use crate::{Error, Result};

pub const BITS_PER_LEVEL_MIN: u8 = 1;
pub const BITS_PER_LEVEL_MAX: u8 = 5;
pub const HEIGHT_MIN: u8 = 1;

/// largest path proof a tree may require, in bytes
pub const MAX_PATH_SIZE: usize = 1024;

/// format version of both persisted records
pub const STORAGE_VERSION: u8 = 0;

/// size of the persisted tree record
pub const TREE_RECORD_SIZE: usize = 3 + NONCE_SIZE;

/// tallest tree whose labels still fit 64 bits
pub const fn height_max(bits_per_level: u8) -> u8 {
    64 / bits_per_level
}

/// check tree shape bounds
pub fn validate_tree_parameters(bits_per_level: u8, height: u8) -> Result<()> {
    if !(BITS_PER_LEVEL_MIN..=BITS_PER_LEVEL_MAX).contains(&bits_per_level) {
        return Err(Error::BitsPerLevelInvalid);
    }

    let fan_out = 1usize << bits_per_level;
    if height < HEIGHT_MIN
        || height > height_max(bits_per_level)
        || (fan_out - 1) * height as usize * HASH_SIZE > MAX_PATH_SIZE
    {
        return Err(Error::HeightInvalid);
    }
    Ok(())
}

/// shape of a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeParams {
    pub bits_per_level: u8,
    pub height: u8,
}

impl TreeParams {
    pub fn new(bits_per_level: u8, height: u8) -> Result<Self> {
        validate_tree_parameters(bits_per_level, height)?;
        Ok(Self {
            bits_per_level,
            height,
        })
    }

    pub fn fan_out(&self) -> usize {
        1usize << self.bits_per_level
    }

    /// number of sibling hashes in a path proof
    pub fn aux_hash_count(&self) -> usize {
        (self.fan_out() - 1) * self.height as usize
    }
}

/// persisted tree configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRecord {
    pub params: TreeParams,
    pub key_derivation_nonce: [u8; NONCE_SIZE],
}

impl TreeRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TREE_RECORD_SIZE);
        out.push(STORAGE_VERSION);
        out.push(self.params.bits_per_level);
        out.push(self.params.height);
        out.extend_from_slice(&self.key_derivation_nonce);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != TREE_RECORD_SIZE {
            return Err(Error::NvLengthMismatch);
        }
        if bytes[0] != STORAGE_VERSION {
            return Err(Error::NvVersionMismatch);
        }

        let mut key_derivation_nonce = [0u8; NONCE_SIZE];
        key_derivation_nonce.copy_from_slice(&bytes[3..]);
        Ok(Self {
            params: TreeParams {
                bits_per_level: bytes[1],
                height: bytes[2],
            },
            key_derivation_nonce,
        })
    }
}

/// live tree: shape, current root and derived keys
#[derive(Debug, Clone)]
pub struct MerkleTree {
    pub params: TreeParams,
    pub root: Hash,
    pub key_derivation_nonce: [u8; NONCE_SIZE],
    pub keys: TreeKeys,
}

impl MerkleTree {
    /// new empty tree under a fresh random nonce
    pub fn create<P: Platform + ?Sized>(platform: &P, params: TreeParams) -> Result<Self> {
        let mut key_derivation_nonce = [0u8; NONCE_SIZE];
        platform.fill_random(&mut key_derivation_nonce);
        let keys = TreeKeys::derive(platform, &key_derivation_nonce)?;

        Ok(Self {
            params,
            root: merkle::empty_root(&params),
            key_derivation_nonce,
            keys,
        })
    }

    /// rebuild a tree from its record and the root taken from the log
    ///
    /// shape is checked here because the record itself is unauthenticated.
    pub fn restore<P: Platform + ?Sized>(
        platform: &P,
        record: &TreeRecord,
        root: Hash,
    ) -> Result<Self> {
        validate_tree_parameters(record.params.bits_per_level, record.params.height)
            .map_err(|_| Error::TreeInvalid)?;
        let keys = TreeKeys::derive(platform, &record.key_derivation_nonce)?;
        Ok(Self {
            params: record.params,
            root,
            key_derivation_nonce: record.key_derivation_nonce,
            keys,
        })
    }

    pub fn record(&self) -> TreeRecord {
        TreeRecord {
            params: self.params,
            key_derivation_nonce: self.key_derivation_nonce,
        }
    }
}
