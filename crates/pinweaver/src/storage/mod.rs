//! persistent variable storage
//!
//! the engine persists exactly two named records (tree config and the replay
//! log). a write either lands completely or returns an error; the engine
//! never reasons about torn writes.
//!
//! implementations:
//! - memory: process-local map with write fault injection, for tests
//! - sled: embedded database on disk (feature `sled`)

pub mod memory;

#[cfg(feature = "sled")]
pub mod sled;

use crate::Result;

/// variable holding the immutable tree configuration
pub const TREE_VAR: &[u8] = b"pwT0";

/// variable holding the replay log ring
pub const LOG_VAR: &[u8] = b"pwL0";

/// key-value store for named persistent variables
pub trait NvStorage: Send + Sync {
    /// read a variable, `None` when it was never written
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// atomically replace a variable
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// delete a variable
    fn remove(&self, key: &[u8]) -> Result<()>;
}

impl<S: NvStorage + ?Sized> NvStorage for std::sync::Arc<S> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        (**self).remove(key)
    }
}

pub use memory::MemoryStorage;

#[cfg(feature = "sled")]
pub use self::sled::SledStorage;
