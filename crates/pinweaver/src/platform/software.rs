//! software platform - in-memory implementation for testing
//!
//! no hardware binding: the device key lives in process memory and the clock
//! can be skewed from the outside. useful for development and testing, NOT
//! for production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{random_bytes, Hash};
use crate::platform::Platform;
use crate::{Error, Result};

const APPKEY_SALT: &[u8] = b"pinweaver:appkey:v1";
const STORAGE_SEED_INFO: &[u8] = b"pinweaver:storage_seed:v1";

/// software platform for testing
/// NOT SECURE - device key is not hardware bound
pub struct SoftwarePlatform {
    device_key: Zeroizing<[u8; 32]>,
    epoch: Instant,
    /// seconds added on top of the real clock
    skew: AtomicU64,
    /// clock reading at which the current boot started
    boot_at: AtomicU64,
    pcrs: RwLock<HashMap<[u8; 2], Hash>>,
    fail_key_derivation: AtomicBool,
}

impl SoftwarePlatform {
    /// create a platform with a random device key
    pub fn new() -> Self {
        Self::from_device_key(random_bytes())
    }

    /// create with a specific device key (keys survive restarts)
    pub fn from_device_key(device_key: [u8; 32]) -> Self {
        Self {
            device_key: Zeroizing::new(device_key),
            epoch: Instant::now(),
            skew: AtomicU64::new(0),
            boot_at: AtomicU64::new(0),
            pcrs: RwLock::new(HashMap::new()),
            fail_key_derivation: AtomicBool::new(false),
        }
    }

    fn clock(&self) -> u64 {
        self.epoch.elapsed().as_secs() + self.skew.load(Ordering::SeqCst)
    }

    /// move the clock forward
    pub fn advance(&self, secs: u64) {
        self.skew.fetch_add(secs, Ordering::SeqCst);
    }

    /// start a new boot: uptime drops back to zero
    pub fn reboot(&self) {
        self.boot_at.store(self.clock(), Ordering::SeqCst);
    }

    /// set the digest reported for a pcr selection
    pub fn set_pcr_digest(&self, bitmask: [u8; 2], digest: Hash) {
        if let Ok(mut pcrs) = self.pcrs.write() {
            pcrs.insert(bitmask, digest);
        }
    }

    /// make every key derivation fail (simulates a crypto engine fault)
    pub fn set_fail_key_derivation(&self, fail: bool) {
        self.fail_key_derivation.store(fail, Ordering::SeqCst);
    }
}

impl Default for SoftwarePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SoftwarePlatform {
    fn storage_seed(&self) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, self.device_key.as_slice());
        let mut seed = [0u8; 32];
        // 32 bytes is always a valid hkdf-sha256 output length
        if hk.expand(STORAGE_SEED_INFO, &mut seed).is_err() {
            seed = [0u8; 32];
        }
        seed
    }

    fn derive_key(&self, input: &[u8; 32]) -> Result<[u8; 32]> {
        if self.fail_key_derivation.load(Ordering::SeqCst) {
            return Err(Error::CryptoFailure);
        }
        let hk = Hkdf::<Sha256>::new(Some(APPKEY_SALT), self.device_key.as_slice());
        let mut key = [0u8; 32];
        hk.expand(input, &mut key)
            .map_err(|_| Error::CryptoFailure)?;
        Ok(key)
    }

    fn uptime_secs(&self) -> u64 {
        self.clock()
            .saturating_sub(self.boot_at.load(Ordering::SeqCst))
    }

    fn pcr_digest(&self, bitmask: [u8; 2]) -> Result<Hash> {
        let pcrs = self.pcrs.read().map_err(|_| Error::PcrNotMatch)?;
        pcrs.get(&bitmask).copied().ok_or(Error::PcrNotMatch)
    }
}
