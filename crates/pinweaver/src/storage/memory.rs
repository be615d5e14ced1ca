//! in-memory variable store for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::storage::NvStorage;
use crate::{Error, Result};

/// process-local storage
pub struct MemoryStorage {
    vars: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            vars: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// reject every following write until turned off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl NvStorage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let vars = self.vars.read().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(vars.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("write rejected".into()));
        }
        let mut vars = self.vars.write().map_err(|e| Error::Storage(e.to_string()))?;
        vars.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let mut vars = self.vars.write().map_err(|e| Error::Storage(e.to_string()))?;
        vars.remove(key);
        Ok(())
    }
}
