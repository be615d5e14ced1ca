//! leaf data model
//!
//! a leaf is one credential record. its wrapped form is held by the caller:
//!
//! ```text
//! header(8) | hmac(32) | iv(12) | public[pub_len] | cipher_text[sec_len]
//! ```
//!
//! the public part travels in clear, the sensitive part is encrypted under
//! the tree's wrap key and the hmac covers everything before it.
//! new public fields are only ever appended; a minor version bump adds
//! fields at the end and older leaves read them as zero.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{hex_hash, Hash, HASH_SIZE, WRAP_IV_SIZE};
use crate::message::Reader;
use crate::{Error, Result};

pub const LEAF_MAJOR_VERSION: u16 = 0;
pub const LEAF_MINOR_VERSION: u16 = 1;

pub const SECRET_SIZE: usize = 32;

/// rows in a delay schedule
pub const SCHED_COUNT: usize = 16;

/// pcr criteria slots in a leaf
pub const MAX_PCR_CRITERIA_COUNT: usize = 2;

/// wait value meaning "never again"
pub const BLOCK_ATTEMPTS: u32 = u32::MAX;

pub const LEAF_HEADER_SIZE: usize = 8;
pub const DELAY_SCHEDULE_SIZE: usize = SCHED_COUNT * 8;
pub const TIMESTAMP_SIZE: usize = 12;
pub const PCR_CRITERION_SIZE: usize = 2 + HASH_SIZE;
pub const PCR_CRITERIA_SIZE: usize = MAX_PCR_CRITERIA_COUNT * PCR_CRITERION_SIZE;

/// public data of a minor version 0 leaf (no pcr criteria)
pub const PUBLIC_DATA_SIZE_V0: usize = 8 + DELAY_SCHEDULE_SIZE + TIMESTAMP_SIZE + 4;
pub const PUBLIC_DATA_SIZE: usize = PUBLIC_DATA_SIZE_V0 + PCR_CRITERIA_SIZE;
pub const SENSITIVE_DATA_SIZE: usize = 3 * SECRET_SIZE;
pub const LEAF_PAYLOAD_SIZE: usize = PUBLIC_DATA_SIZE + SENSITIVE_DATA_SIZE;

/// bytes in front of the public data of a wrapped leaf
pub const WRAPPED_LEAF_PREFIX: usize = LEAF_HEADER_SIZE + HASH_SIZE + WRAP_IV_SIZE;

/// size of a wrapped leaf in the current version
pub const WRAPPED_LEAF_SIZE: usize = WRAPPED_LEAF_PREFIX + LEAF_PAYLOAD_SIZE;

/// one row of a delay schedule: once `attempt_count` failures are reached,
/// the next attempt must wait `time_diff` seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayScheduleEntry {
    pub attempt_count: u32,
    pub time_diff: u32,
}

impl DelayScheduleEntry {
    pub const fn new(attempt_count: u32, time_diff: u32) -> Self {
        Self {
            attempt_count,
            time_diff,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attempt_count == 0
    }
}

pub type DelaySchedule = [DelayScheduleEntry; SCHED_COUNT];

/// build a full schedule from leading rows, zero filling the rest
///
/// rows beyond `SCHED_COUNT` are dropped.
pub fn delay_schedule(rows: &[(u32, u32)]) -> DelaySchedule {
    let mut schedule = [DelayScheduleEntry::default(); SCHED_COUNT];
    for (slot, &(attempt_count, time_diff)) in schedule.iter_mut().zip(rows) {
        *slot = DelayScheduleEntry::new(attempt_count, time_diff);
    }
    schedule
}

/// boot relative point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// restart count of the boot this was taken in
    pub boot_count: u32,
    /// seconds since that boot
    pub timer_value: u64,
}

impl Timestamp {
    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.boot_count.to_le_bytes());
        out.extend_from_slice(&self.timer_value.to_le_bytes());
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            boot_count: r.u32()?,
            timer_value: r.u64()?,
        })
    }
}

/// expected digest over a selection of pcr registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidPcrValue {
    pub bitmask: [u8; 2],
    #[serde(with = "hex_hash")]
    pub digest: Hash,
}

impl ValidPcrValue {
    /// a zero bitmask marks the end of the criteria list
    pub fn is_empty(&self) -> bool {
        self.bitmask == [0, 0]
    }
}

pub type PcrCriteria = [ValidPcrValue; MAX_PCR_CRITERIA_COUNT];

pub(crate) fn write_schedule(schedule: &DelaySchedule, out: &mut Vec<u8>) {
    for row in schedule {
        out.extend_from_slice(&row.attempt_count.to_le_bytes());
        out.extend_from_slice(&row.time_diff.to_le_bytes());
    }
}

pub(crate) fn read_schedule(r: &mut Reader<'_>) -> Result<DelaySchedule> {
    let mut schedule = [DelayScheduleEntry::default(); SCHED_COUNT];
    for row in schedule.iter_mut() {
        row.attempt_count = r.u32()?;
        row.time_diff = r.u32()?;
    }
    Ok(schedule)
}

pub(crate) fn write_pcr_criteria(criteria: &PcrCriteria, out: &mut Vec<u8>) {
    for c in criteria {
        out.extend_from_slice(&c.bitmask);
        out.extend_from_slice(&c.digest);
    }
}

pub(crate) fn read_pcr_criteria(r: &mut Reader<'_>) -> Result<PcrCriteria> {
    let mut criteria = [ValidPcrValue::default(); MAX_PCR_CRITERIA_COUNT];
    for c in criteria.iter_mut() {
        c.bitmask = r.array()?;
        c.digest = r.array()?;
    }
    Ok(criteria)
}

/// public leaf fields, authenticated but not encrypted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPublicData {
    pub label: u64,
    pub delay_schedule: DelaySchedule,
    pub timestamp: Timestamp,
    pub attempt_count: u32,
    pub valid_pcr_criteria: PcrCriteria,
}

impl LeafPublicData {
    pub fn new(label: u64, delay_schedule: DelaySchedule, valid_pcr_criteria: PcrCriteria) -> Self {
        Self {
            label,
            delay_schedule,
            timestamp: Timestamp::default(),
            attempt_count: 0,
            valid_pcr_criteria,
        }
    }

    /// current version layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_DATA_SIZE);
        out.extend_from_slice(&self.label.to_le_bytes());
        write_schedule(&self.delay_schedule, &mut out);
        self.timestamp.write(&mut out);
        out.extend_from_slice(&self.attempt_count.to_le_bytes());
        write_pcr_criteria(&self.valid_pcr_criteria, &mut out);
        out
    }

    /// parse from a public part of any known or newer minor version
    ///
    /// fields missing from an older layout read as zero, fields appended by
    /// a newer layout are ignored.
    pub fn from_prefix(bytes: &[u8]) -> Result<Self> {
        let mut padded = [0u8; PUBLIC_DATA_SIZE];
        let n = bytes.len().min(PUBLIC_DATA_SIZE);
        padded[..n].copy_from_slice(&bytes[..n]);

        let mut r = Reader::new(&padded);
        let label = r.u64()?;
        let delay_schedule = read_schedule(&mut r)?;
        let timestamp = Timestamp::read(&mut r)?;
        let attempt_count = r.u32()?;
        let valid_pcr_criteria = read_pcr_criteria(&mut r)?;
        r.finish()?;

        Ok(Self {
            label,
            delay_schedule,
            timestamp,
            attempt_count,
            valid_pcr_criteria,
        })
    }
}

/// secret leaf fields, only ever stored encrypted
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct LeafSensitiveData {
    pub low_entropy_secret: [u8; SECRET_SIZE],
    pub high_entropy_secret: [u8; SECRET_SIZE],
    pub reset_secret: [u8; SECRET_SIZE],
}

impl LeafSensitiveData {
    pub fn new(
        low_entropy_secret: [u8; SECRET_SIZE],
        high_entropy_secret: [u8; SECRET_SIZE],
        reset_secret: [u8; SECRET_SIZE],
    ) -> Self {
        Self {
            low_entropy_secret,
            high_entropy_secret,
            reset_secret,
        }
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; SENSITIVE_DATA_SIZE]> {
        let mut out = Zeroizing::new([0u8; SENSITIVE_DATA_SIZE]);
        out[..SECRET_SIZE].copy_from_slice(&self.low_entropy_secret);
        out[SECRET_SIZE..2 * SECRET_SIZE].copy_from_slice(&self.high_entropy_secret);
        out[2 * SECRET_SIZE..].copy_from_slice(&self.reset_secret);
        out
    }

    pub fn from_bytes(bytes: &[u8; SENSITIVE_DATA_SIZE]) -> Self {
        let mut sec = Self::new([0u8; SECRET_SIZE], [0u8; SECRET_SIZE], [0u8; SECRET_SIZE]);
        sec.low_entropy_secret.copy_from_slice(&bytes[..SECRET_SIZE]);
        sec.high_entropy_secret
            .copy_from_slice(&bytes[SECRET_SIZE..2 * SECRET_SIZE]);
        sec.reset_secret.copy_from_slice(&bytes[2 * SECRET_SIZE..]);
        sec
    }
}

impl std::fmt::Debug for LeafSensitiveData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LeafSensitiveData(..)")
    }
}

/// a decrypted leaf
#[derive(Debug, Clone)]
pub struct LeafData {
    pub public: LeafPublicData,
    pub sensitive: LeafSensitiveData,
}

/// version and section lengths of a wrapped leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafHeader {
    pub minor: u16,
    pub major: u16,
    pub pub_len: u16,
    pub sec_len: u16,
}

impl LeafHeader {
    /// header written on every leaf this engine produces
    pub const fn current() -> Self {
        Self {
            minor: LEAF_MINOR_VERSION,
            major: LEAF_MAJOR_VERSION,
            pub_len: PUBLIC_DATA_SIZE as u16,
            sec_len: SENSITIVE_DATA_SIZE as u16,
        }
    }

    pub fn to_bytes(&self) -> [u8; LEAF_HEADER_SIZE] {
        let mut out = [0u8; LEAF_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.minor.to_le_bytes());
        out[2..4].copy_from_slice(&self.major.to_le_bytes());
        out[4..6].copy_from_slice(&self.pub_len.to_le_bytes());
        out[6..8].copy_from_slice(&self.sec_len.to_le_bytes());
        out
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            minor: r.u16()?,
            major: r.u16()?,
            pub_len: r.u16()?,
            sec_len: r.u16()?,
        })
    }

    /// length of public plus sensitive sections
    pub fn payload_len(&self) -> usize {
        self.pub_len as usize + self.sec_len as usize
    }
}

/// the caller-held, encrypted and authenticated form of a leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedLeaf {
    pub header: LeafHeader,
    pub hmac: Hash,
    pub iv: [u8; WRAP_IV_SIZE],
    /// public section as received, `pub_len` bytes
    pub public: Vec<u8>,
    /// encrypted section as received, `sec_len` bytes
    pub cipher_text: Vec<u8>,
}

impl WrappedLeaf {
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = WRAPPED_LEAF_PREFIX + self.public.len() + self.cipher_text.len();
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.hmac);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&self.cipher_text);
        out
    }

    /// parse a wrapped leaf whose header was already checked against the
    /// remaining buffer length
    pub(crate) fn read(r: &mut Reader<'_>, header: LeafHeader) -> Result<Self> {
        let hmac = r.array()?;
        let iv = r.array()?;
        let public = r.take(header.pub_len as usize)?.to_vec();
        let cipher_text = r.take(header.sec_len as usize)?.to_vec();
        Ok(Self {
            header,
            hmac,
            iv,
            public,
            cipher_text,
        })
    }

    /// parse a standalone wrapped leaf, e.g. one loaded from caller storage
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let header = LeafHeader::read(&mut r)?;
        if bytes.len() != WRAPPED_LEAF_PREFIX + header.payload_len() {
            return Err(Error::LengthInvalid);
        }
        let leaf = Self::read(&mut r, header)?;
        r.finish()?;
        Ok(leaf)
    }

    /// public fields in the clear, without authenticating them
    pub fn public_data(&self) -> Result<LeafPublicData> {
        LeafPublicData::from_prefix(&self.public)
    }
}
