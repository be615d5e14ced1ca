//! sled-backed variable store (embedded, zero config)

use std::path::Path;

use tracing::info;

use crate::storage::NvStorage;
use crate::{Error, Result};

/// persistent storage in an embedded sled database
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening storage at {}", path.display());
        let db = sled::open(path).map_err(|e| Error::Storage(format!("sled: {}", e)))?;
        Ok(Self { db })
    }
}

impl NvStorage for SledStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(|e| Error::Storage(format!("sled: {}", e)))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .map_err(|e| Error::Storage(format!("sled: {}", e)))?;
        // a write only counts once it is durable
        self.db
            .flush()
            .map_err(|e| Error::Storage(format!("sled flush: {}", e)))?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.db
            .remove(key)
            .map_err(|e| Error::Storage(format!("sled: {}", e)))?;
        Ok(())
    }
}
