//! merkle path authentication
//!
//! a node's hash is sha256 over its children in slot order. a proof for a
//! label is the sibling hashes of every node on the way to the root, lowest
//! level first, each level contributing `fan_out - 1` hashes in slot order
//! with the node's own slot left out.
//!
//! ```text
//!                  root
//!          /     /     \     \
//!        h0     h1     [.]    h3      <- level 1 siblings
//!             / / \ \
//!           s0 s1 [.] s3              <- level 0 siblings
//!                  |
//!                 leaf hmac
//! ```

use crate::crypto::{sha256, Hash, HASH_SIZE};
use crate::tree::TreeParams;
use crate::{Error, Result};

/// hash of an empty leaf slot
pub const EMPTY_HASH: Hash = [0u8; HASH_SIZE];

/// parent hash of `child` placed at `location` among `siblings`
///
/// requires `location <= siblings.len()`.
pub fn compute_hash(siblings: &[Hash], location: usize, child: &Hash) -> Hash {
    let mut parts: Vec<&[u8]> = Vec::with_capacity(siblings.len() + 1);
    parts.extend(siblings[..location].iter().map(|h| h.as_slice()));
    parts.push(child.as_slice());
    parts.extend(siblings[location..].iter().map(|h| h.as_slice()));
    sha256(&parts)
}

/// root reached by walking `child` up along `path_hashes`
///
/// `path_hashes` must hold exactly `params.aux_hash_count()` hashes.
pub fn compute_root_hash(
    params: &TreeParams,
    label: u64,
    path_hashes: &[Hash],
    child: &Hash,
) -> Hash {
    let num_aux = params.fan_out() - 1;
    let mask = num_aux as u64;
    let mut index = label;
    let mut current = *child;

    for level in path_hashes.chunks(num_aux).take(params.height as usize) {
        current = compute_hash(level, (index & mask) as usize, &current);
        index >>= params.bits_per_level;
    }
    current
}

/// check that `child` sits at `label` under `root`
pub fn authenticate_path(
    params: &TreeParams,
    root: &Hash,
    label: u64,
    path_hashes: &[Hash],
    child: &Hash,
) -> Result<()> {
    if path_hashes.len() != params.aux_hash_count() {
        return Err(Error::LengthInvalid);
    }
    if compute_root_hash(params, label, path_hashes, child) != *root {
        return Err(Error::PathAuthFailed);
    }
    Ok(())
}

/// labels may only use the low `bits_per_level * height` bits
pub fn validate_label(params: &TreeParams, label: u64) -> Result<()> {
    let used = params.bits_per_level as u32 * params.height as u32;
    match label.checked_shr(used) {
        Some(0) | None => Ok(()),
        Some(_) => Err(Error::LabelInvalid),
    }
}

/// hash of an empty subtree with `levels` levels
pub fn empty_subtree_hash(bits_per_level: u8, levels: u8) -> Hash {
    let fan_out = 1usize << bits_per_level;
    let mut current = EMPTY_HASH;
    for _ in 0..levels {
        current = {
            let parts: Vec<&[u8]> = vec![current.as_slice(); fan_out];
            sha256(&parts)
        };
    }
    current
}

/// root of a tree with every leaf empty
pub fn empty_root(params: &TreeParams) -> Hash {
    empty_subtree_hash(params.bits_per_level, params.height)
}
