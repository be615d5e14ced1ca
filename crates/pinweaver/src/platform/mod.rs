//! platform trait and implementations
//!
//! the platform is everything the engine borrows from the secure element it
//! runs on:
//! - a device-unique storage seed
//! - a hardware-bound key derivation function
//! - a boot-relative clock in seconds
//! - digests over selected platform configuration registers
//! - a random number generator
//!
//! implementations:
//! - software: seed held in memory, manual clock skew, settable pcrs

#[cfg(feature = "software")]
pub mod software;

use rand::RngCore;

use crate::crypto::Hash;
use crate::Result;

/// platform trait - pluggable source of device secrets, time and pcr state
pub trait Platform: Send + Sync {
    /// device-unique seed mixed with a tree's nonce before key derivation
    fn storage_seed(&self) -> [u8; 32];

    /// derive a 256-bit application key from a 256-bit input
    ///
    /// must be deterministic for a given device and input.
    fn derive_key(&self, input: &[u8; 32]) -> Result<[u8; 32]>;

    /// seconds elapsed since this boot
    fn uptime_secs(&self) -> u64;

    /// sha256 over the pcr registers selected by `bitmask`
    fn pcr_digest(&self, bitmask: [u8; 2]) -> Result<Hash>;

    /// fill `buf` from the hardware rng
    fn fill_random(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}

impl<P: Platform + ?Sized> Platform for std::sync::Arc<P> {
    fn storage_seed(&self) -> [u8; 32] {
        (**self).storage_seed()
    }

    fn derive_key(&self, input: &[u8; 32]) -> Result<[u8; 32]> {
        (**self).derive_key(input)
    }

    fn uptime_secs(&self) -> u64 {
        (**self).uptime_secs()
    }

    fn pcr_digest(&self, bitmask: [u8; 2]) -> Result<Hash> {
        (**self).pcr_digest(bitmask)
    }

    fn fill_random(&self, buf: &mut [u8]) {
        (**self).fill_random(buf)
    }
}
