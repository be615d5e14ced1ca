//! replay log
//!
//! a fixed depth ring of committed root transitions, newest first. entry 0
//! always carries the tree's current root. callers holding a stale leaf use
//! the log to find out what happened to it and to replay the outcome.
//!
//! persisted layout:
//!
//! ```text
//! storage_version(1) | restart_count(4) | entries[LOG_ENTRY_COUNT] (73 each)
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{hex_hash, Hash, HASH_SIZE};
use crate::leaf::Timestamp;
use crate::message::{MessageType, Reader};
use crate::storage::{NvStorage, LOG_VAR};
use crate::tree::STORAGE_VERSION;
use crate::{Error, Result};

/// entries kept in the ring
pub const LOG_ENTRY_COUNT: usize = 2;

pub const LOG_ENTRY_SIZE: usize = HASH_SIZE + 8 + 1 + HASH_SIZE;

pub const LOG_STORAGE_SIZE: usize = 1 + 4 + LOG_ENTRY_COUNT * LOG_ENTRY_SIZE;

/// what produced a root transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogAction {
    /// unused slot
    Empty,
    ResetTree,
    InsertLeaf {
        #[serde(with = "hex_hash")]
        leaf_hmac: Hash,
    },
    RemoveLeaf,
    /// outcome of a try_auth or reset_auth
    Auth { return_code: u32, timestamp: Timestamp },
}

impl LogAction {
    pub fn message_type(&self) -> MessageType {
        match self {
            LogAction::Empty => MessageType::Invalid,
            LogAction::ResetTree => MessageType::ResetTree,
            LogAction::InsertLeaf { .. } => MessageType::InsertLeaf,
            LogAction::RemoveLeaf => MessageType::RemoveLeaf,
            LogAction::Auth { .. } => MessageType::TryAuth,
        }
    }
}

/// one committed root transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// root after the operation
    #[serde(with = "hex_hash")]
    pub root: Hash,
    pub label: u64,
    #[serde(flatten)]
    pub action: LogAction,
}

impl LogEntry {
    pub const EMPTY: LogEntry = LogEntry {
        root: [0u8; HASH_SIZE],
        label: 0,
        action: LogAction::Empty,
    };

    pub fn is_empty(&self) -> bool {
        self.action == LogAction::Empty
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.root);
        out.extend_from_slice(&self.label.to_le_bytes());
        out.push(self.action.message_type() as u8);

        let mut payload = [0u8; HASH_SIZE];
        match &self.action {
            LogAction::InsertLeaf { leaf_hmac } => payload = *leaf_hmac,
            LogAction::Auth {
                return_code,
                timestamp,
            } => {
                payload[0..4].copy_from_slice(&return_code.to_le_bytes());
                payload[4..8].copy_from_slice(&timestamp.boot_count.to_le_bytes());
                payload[8..16].copy_from_slice(&timestamp.timer_value.to_le_bytes());
            }
            LogAction::Empty | LogAction::ResetTree | LogAction::RemoveLeaf => {}
        }
        out.extend_from_slice(&payload);
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self> {
        let root = r.array()?;
        let label = r.u64()?;
        let kind = MessageType::try_from(r.u8()?)?;
        let payload: [u8; HASH_SIZE] = r.array()?;

        let action = match kind {
            MessageType::Invalid => LogAction::Empty,
            MessageType::ResetTree => LogAction::ResetTree,
            MessageType::InsertLeaf => LogAction::InsertLeaf { leaf_hmac: payload },
            MessageType::RemoveLeaf => LogAction::RemoveLeaf,
            MessageType::TryAuth => {
                let mut p = Reader::new(&payload);
                LogAction::Auth {
                    return_code: p.u32()?,
                    timestamp: Timestamp::read(&mut p)?,
                }
            }
            _ => return Err(Error::TypeInvalid),
        };
        Ok(Self {
            root,
            label,
            action,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOG_ENTRY_SIZE);
        self.write(&mut out);
        out
    }
}

/// the persisted ring plus the restart counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStorage {
    pub restart_count: u32,
    pub entries: [LogEntry; LOG_ENTRY_COUNT],
}

impl LogStorage {
    /// log of a freshly reset tree
    pub fn new(root: Hash) -> Self {
        let mut entries = [LogEntry::EMPTY; LOG_ENTRY_COUNT];
        entries[0] = LogEntry {
            root,
            label: 0,
            action: LogAction::ResetTree,
        };
        Self {
            restart_count: 0,
            entries,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOG_STORAGE_SIZE);
        out.push(STORAGE_VERSION);
        out.extend_from_slice(&self.restart_count.to_le_bytes());
        for entry in &self.entries {
            entry.write(&mut out);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != LOG_STORAGE_SIZE {
            return Err(Error::NvLengthMismatch);
        }
        if bytes[0] != STORAGE_VERSION {
            return Err(Error::NvVersionMismatch);
        }

        let mut r = Reader::new(&bytes[1..]);
        let restart_count = r.u32()?;
        let mut entries = [LogEntry::EMPTY; LOG_ENTRY_COUNT];
        for entry in entries.iter_mut() {
            *entry = LogEntry::read(&mut r)?;
        }
        r.finish()?;
        Ok(Self {
            restart_count,
            entries,
        })
    }

    pub fn load<S: NvStorage + ?Sized>(storage: &S) -> Result<Self> {
        let bytes = storage.get(LOG_VAR)?.ok_or(Error::NvEmpty)?;
        Self::from_bytes(&bytes)
    }

    pub fn store<S: NvStorage + ?Sized>(&self, storage: &S) -> Result<()> {
        storage.set(LOG_VAR, &self.to_bytes())
    }

    /// newest root, i.e. the tree's current root
    pub fn root(&self) -> Hash {
        self.entries[0].root
    }

    /// number of populated entries
    pub fn len(&self) -> usize {
        self.entries.iter().take_while(|e| !e.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// populated entries, newest first
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().take_while(|e| !e.is_empty())
    }

    /// shift the ring down one slot and put `entry` on top
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.rotate_right(1);
        self.entries[0] = entry;
    }

    /// index of the newest entry with `root`
    ///
    /// on a miss the error carries nothing, use [`Self::relevant_index`] to
    /// fall back to the oldest populated entry.
    pub fn find_entry(&self, root: &Hash) -> Result<usize> {
        self.iter()
            .position(|e| e.root == *root)
            .ok_or(Error::RootNotFound)
    }

    /// matching index, or the oldest populated one when `root` is unknown
    pub fn relevant_index(&self, root: &Hash) -> Option<usize> {
        match self.find_entry(root) {
            Ok(index) => Some(index),
            Err(_) => self.len().checked_sub(1),
        }
    }
}

/// load the ring, append `entry`, persist it
///
/// the caller must only adopt the new root once this returned ok.
pub fn append<S: NvStorage + ?Sized>(storage: &S, entry: LogEntry) -> Result<()> {
    let mut log = LogStorage::load(storage)?;
    log.push(entry);
    log.store(storage)?;
    debug!(
        "log append: type {:?} label {} root {}",
        entry.action.message_type(),
        entry.label,
        hex::encode(entry.root)
    );
    Ok(())
}
