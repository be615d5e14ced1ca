//! pcr criteria gate
//!
//! a leaf may be bound to up to two expected pcr digests; at least one of
//! them has to match the live platform state.

use tracing::warn;

use crate::leaf::PcrCriteria;
use crate::platform::Platform;
use crate::{Error, Result};

/// ok when the leaf is unbound or any listed criterion matches
pub fn validate_pcr_criteria<P: Platform + ?Sized>(
    platform: &P,
    criteria: &PcrCriteria,
) -> Result<()> {
    for (index, criterion) in criteria.iter().enumerate() {
        if criterion.is_empty() {
            // an empty first slot means the leaf is not bound at all
            if index == 0 {
                return Ok(());
            }
            break;
        }

        match platform.pcr_digest(criterion.bitmask) {
            Ok(digest) if digest == criterion.digest => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                warn!("pcr read error, bitmask {:?}: {}", criterion.bitmask, e);
                return Err(Error::PcrNotMatch);
            }
        }
    }

    warn!("no criteria matches pcr values");
    Err(Error::PcrNotMatch)
}
