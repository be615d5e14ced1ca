//! error types for pinweaver
//!
//! every variant maps onto a stable wire result code so a response can be
//! decoded by the caller without sharing this crate's types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// result code for a successful request
pub const SUCCESS: u32 = 0;

/// first engine-specific result code
pub const ERROR_BASE: u32 = 0x10000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("protocol version mismatch")]
    VersionMismatch,

    #[error("tree is not initialized or has invalid parameters")]
    TreeInvalid,

    #[error("length invalid")]
    LengthInvalid,

    #[error("unknown or unsupported message type")]
    TypeInvalid,

    #[error("bits per level invalid")]
    BitsPerLevelInvalid,

    #[error("height invalid")]
    HeightInvalid,

    #[error("label out of range")]
    LabelInvalid,

    #[error("delay schedule invalid")]
    DelayScheduleInvalid,

    #[error("merkle path authentication failed")]
    PathAuthFailed,

    #[error("leaf version mismatch")]
    LeafVersionMismatch,

    #[error("leaf authentication failed")]
    HmacAuthFailed,

    #[error("low entropy secret mismatch")]
    LowEntropyAuthFailed,

    #[error("reset secret mismatch")]
    ResetAuthFailed,

    #[error("crypto engine failure")]
    CryptoFailure,

    #[error("rate limited: wait {seconds_to_wait}s")]
    RateLimitReached { seconds_to_wait: u32 },

    #[error("root not found in log")]
    RootNotFound,

    #[error("persistent variable absent")]
    NvEmpty,

    #[error("persistent variable has wrong length")]
    NvLengthMismatch,

    #[error("persistent variable has wrong storage version")]
    NvVersionMismatch,

    #[error("no pcr criteria satisfied")]
    PcrNotMatch,

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// wire result code for this error
    pub fn code(&self) -> u32 {
        let offset = match self {
            Error::VersionMismatch => 0x00,
            Error::TreeInvalid => 0x01,
            Error::LengthInvalid => 0x02,
            Error::TypeInvalid => 0x03,
            Error::BitsPerLevelInvalid => 0x04,
            Error::HeightInvalid => 0x05,
            Error::LabelInvalid => 0x06,
            Error::DelayScheduleInvalid => 0x07,
            Error::PathAuthFailed => 0x08,
            Error::LeafVersionMismatch => 0x09,
            Error::HmacAuthFailed => 0x0a,
            Error::LowEntropyAuthFailed => 0x0b,
            Error::ResetAuthFailed => 0x0c,
            Error::CryptoFailure => 0x0d,
            Error::RateLimitReached { .. } => 0x0e,
            Error::RootNotFound => 0x0f,
            Error::NvEmpty => 0x10,
            Error::NvLengthMismatch => 0x11,
            Error::NvVersionMismatch => 0x12,
            Error::PcrNotMatch => 0x13,
            Error::Storage(_) => 0x14,
        };
        ERROR_BASE + offset
    }

    /// decode a wire result code
    ///
    /// `seconds_to_wait` is only used for the rate limit code; the storage
    /// message does not travel over the wire.
    pub fn from_code(code: u32, seconds_to_wait: u32) -> Option<Self> {
        let err = match code.checked_sub(ERROR_BASE)? {
            0x00 => Error::VersionMismatch,
            0x01 => Error::TreeInvalid,
            0x02 => Error::LengthInvalid,
            0x03 => Error::TypeInvalid,
            0x04 => Error::BitsPerLevelInvalid,
            0x05 => Error::HeightInvalid,
            0x06 => Error::LabelInvalid,
            0x07 => Error::DelayScheduleInvalid,
            0x08 => Error::PathAuthFailed,
            0x09 => Error::LeafVersionMismatch,
            0x0a => Error::HmacAuthFailed,
            0x0b => Error::LowEntropyAuthFailed,
            0x0c => Error::ResetAuthFailed,
            0x0d => Error::CryptoFailure,
            0x0e => Error::RateLimitReached { seconds_to_wait },
            0x0f => Error::RootNotFound,
            0x10 => Error::NvEmpty,
            0x11 => Error::NvLengthMismatch,
            0x12 => Error::NvVersionMismatch,
            0x13 => Error::PcrNotMatch,
            0x14 => Error::Storage(String::new()),
            _ => return None,
        };
        Some(err)
    }
}

/// result code for a handler outcome
pub fn result_code(result: &Result<()>) -> u32 {
    match result {
        Ok(()) => SUCCESS,
        Err(e) => e.code(),
    }
}
