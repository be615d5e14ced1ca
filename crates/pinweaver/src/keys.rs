//! per-tree key derivation
//!
//! the storage seed is xored with the tree's nonce, then the key type is
//! mixed into word 6 so the wrap key and the hmac key come from distinct
//! derivation inputs.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::platform::Platform;
use crate::Result;

/// size of the per-tree key derivation nonce
pub const NONCE_SIZE: usize = 16;

const KEY_TYPE_WRAP: u32 = 0x0000_0000;
const KEY_TYPE_HMAC: u32 = 0xffff_ffff;

/// byte offset of the key type word in the derivation input
const TYPE_FIELD: usize = 6 * 4;

/// symmetric keys bound to one tree on one device
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TreeKeys {
    pub wrap_key: [u8; 32],
    pub hmac_key: [u8; 32],
}

impl TreeKeys {
    /// derive both keys for a tree nonce
    pub fn derive<P: Platform + ?Sized>(platform: &P, nonce: &[u8; NONCE_SIZE]) -> Result<Self> {
        let mut input = platform.storage_seed();
        for (b, n) in input.iter_mut().zip(nonce.iter()) {
            *b ^= n;
        }

        let wrap_key = derive_typed(platform, &input, KEY_TYPE_WRAP)?;
        let hmac_key = derive_typed(platform, &input, KEY_TYPE_HMAC)?;
        input.zeroize();

        Ok(Self { wrap_key, hmac_key })
    }
}

impl std::fmt::Debug for TreeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TreeKeys(..)")
    }
}

fn derive_typed<P: Platform + ?Sized>(
    platform: &P,
    input: &[u8; 32],
    key_type: u32,
) -> Result<[u8; 32]> {
    let mut typed = *input;
    let field = u32::from_le_bytes([
        typed[TYPE_FIELD],
        typed[TYPE_FIELD + 1],
        typed[TYPE_FIELD + 2],
        typed[TYPE_FIELD + 3],
    ]) ^ key_type;
    typed[TYPE_FIELD..TYPE_FIELD + 4].copy_from_slice(&field.to_le_bytes());

    let key = platform.derive_key(&typed);
    typed.zeroize();
    key
}
