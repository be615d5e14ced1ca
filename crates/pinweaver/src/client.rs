//! caller side of the protocol
//!
//! the engine keeps only the root, so whoever talks to it has to keep the
//! rest: every leaf hmac by label plus the wrapped leaves themselves. this
//! module holds that mirror, builds requests with the right path hashes and
//! folds responses and log entries back into the mirror.

use std::collections::BTreeMap;

use zeroize::Zeroizing;

use crate::crypto::{sha256, Hash};
use crate::error::Error;
use crate::leaf::{DelaySchedule, LeafSensitiveData, PcrCriteria, WrappedLeaf, SECRET_SIZE};
use crate::log::{LogAction, LogEntry};
use crate::merkle::{empty_subtree_hash, validate_label, EMPTY_HASH};
use crate::message::{InsertLeafRequest, Request, Response};
use crate::tree::TreeParams;
use crate::Result;

/// sparse mirror of the engine's tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTree {
    params: TreeParams,
    leaves: BTreeMap<u64, Hash>,
}

impl ClientTree {
    /// mirror of a freshly reset tree
    pub fn new(params: TreeParams) -> Self {
        Self {
            params,
            leaves: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> TreeParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// put `hmac` into the empty slot at `label`
    pub fn insert(&mut self, label: u64, hmac: Hash) -> Result<()> {
        if self.leaves.contains_key(&label) {
            return Err(Error::LabelInvalid);
        }
        self.update(label, hmac)
    }

    /// put `hmac` at `label`, replacing whatever was there
    pub fn update(&mut self, label: u64, hmac: Hash) -> Result<()> {
        validate_label(&self.params, label)?;
        self.leaves.insert(label, hmac);
        Ok(())
    }

    /// clear the slot at `label`
    pub fn remove(&mut self, label: u64) -> Option<Hash> {
        self.leaves.remove(&label)
    }

    /// label prefix of the node `levels` above the leaves
    fn prefix(&self, label: u64, levels: u32) -> u64 {
        label
            .checked_shr(self.params.bits_per_level as u32 * levels)
            .unwrap_or(0)
    }

    /// hash of the node `levels` above the leaves covering `prefix`
    fn node_hash(&self, levels: u32, prefix: u64) -> Hash {
        let shift = self.params.bits_per_level as u32 * levels;
        let start = prefix.checked_shl(shift).unwrap_or(0);
        let end = match 1u64.checked_shl(shift) {
            Some(width) => start | (width - 1),
            None => u64::MAX,
        };

        if self.leaves.range(start..=end).next().is_none() {
            return empty_subtree_hash(self.params.bits_per_level, levels as u8);
        }
        if levels == 0 {
            return self.leaves.get(&prefix).copied().unwrap_or(EMPTY_HASH);
        }

        let children: Vec<Hash> = (0..self.params.fan_out() as u64)
            .map(|i| self.node_hash(levels - 1, (prefix << self.params.bits_per_level) | i))
            .collect();
        let parts: Vec<&[u8]> = children.iter().map(|h| h.as_slice()).collect();
        sha256(&parts)
    }

    /// root the engine should hold if the mirror is in sync
    pub fn root(&self) -> Hash {
        self.node_hash(self.params.height as u32, 0)
    }

    /// sibling hashes proving `label`, lowest level first
    pub fn path(&self, label: u64) -> Result<Vec<Hash>> {
        validate_label(&self.params, label)?;

        let bits = self.params.bits_per_level;
        let mask = self.params.fan_out() as u64 - 1;
        let mut path = Vec::with_capacity(self.params.aux_hash_count());

        for level in 0..self.params.height as u32 {
            let parent = self.prefix(label, level + 1);
            let own = self.prefix(label, level) & mask;
            for i in (0..=mask).filter(|&i| i != own) {
                path.push(self.node_hash(level, (parent << bits) | i));
            }
        }
        Ok(path)
    }

    /// request placing a new credential at an empty `label`
    pub fn insert_request(
        &self,
        label: u64,
        delay_schedule: DelaySchedule,
        sensitive: LeafSensitiveData,
        valid_pcr_criteria: PcrCriteria,
    ) -> Result<Request> {
        if self.leaves.contains_key(&label) {
            return Err(Error::LabelInvalid);
        }
        Ok(Request::InsertLeaf(InsertLeafRequest {
            label,
            delay_schedule,
            sensitive,
            valid_pcr_criteria,
            path_hashes: self.path(label)?,
        }))
    }

    pub fn remove_request(&self, label: u64) -> Result<Request> {
        let leaf_hmac = *self.leaves.get(&label).ok_or(Error::LabelInvalid)?;
        Ok(Request::RemoveLeaf {
            label,
            leaf_hmac,
            path_hashes: self.path(label)?,
        })
    }

    pub fn try_auth_request(
        &self,
        low_entropy_secret: &[u8; SECRET_SIZE],
        leaf: &WrappedLeaf,
    ) -> Result<Request> {
        let label = leaf.public_data()?.label;
        Ok(Request::TryAuth {
            low_entropy_secret: Zeroizing::new(*low_entropy_secret),
            leaf: leaf.clone(),
            path_hashes: self.path(label)?,
        })
    }

    pub fn reset_auth_request(
        &self,
        reset_secret: &[u8; SECRET_SIZE],
        leaf: &WrappedLeaf,
    ) -> Result<Request> {
        let label = leaf.public_data()?.label;
        Ok(Request::ResetAuth {
            reset_secret: Zeroizing::new(*reset_secret),
            leaf: leaf.clone(),
            path_hashes: self.path(label)?,
        })
    }

    /// ask for the log entries newer than the mirror's root
    pub fn get_log_request(&self) -> Request {
        Request::GetLog { root: self.root() }
    }

    /// ask the engine to bring a stale `leaf` up to the auth logged at `log_root`
    pub fn log_replay_request(&self, log_root: Hash, leaf: &WrappedLeaf) -> Result<Request> {
        let label = leaf.public_data()?.label;
        Ok(Request::LogReplay {
            log_root,
            leaf: leaf.clone(),
            path_hashes: self.path(label)?,
        })
    }

    /// fold the engine's answer to `request` into the mirror
    ///
    /// returns the leaf the caller must store from now on, if the response
    /// carried one. a wrong pin still moves the leaf forward, so that case
    /// returns the new leaf too; check `response.result()` for the outcome.
    /// any other failure means nothing changed and is returned as is.
    pub fn apply(&mut self, request: &Request, response: &Response) -> Result<Option<WrappedLeaf>> {
        match response.result() {
            Ok(()) | Err(Error::LowEntropyAuthFailed) => {}
            Err(e) => return Err(e),
        }

        match request {
            Request::ResetTree {
                bits_per_level,
                height,
            } => {
                *self = Self::new(TreeParams::new(*bits_per_level, *height)?);
                Ok(None)
            }
            Request::RemoveLeaf { label, .. } => {
                self.remove(*label);
                Ok(None)
            }
            _ => match response.data.leaf() {
                Some(leaf) => {
                    let label = leaf.public_data()?.label;
                    self.update(label, leaf.hmac)?;
                    Ok(Some(leaf.clone()))
                }
                None => Ok(None),
            },
        }
    }

    /// roll the mirror forward along log entries returned by get_log
    ///
    /// `entries` are newest first and must reach back to the mirror's root.
    /// insert and remove entries are applied directly; auth entries cannot
    /// be, since their new hmac is only known to whoever holds the leaf, so
    /// they are returned oldest first for replay.
    pub fn catch_up(&mut self, entries: &[LogEntry]) -> Result<Vec<LogEntry>> {
        let root = self.root();
        let known = entries
            .iter()
            .position(|e| e.root == root)
            .ok_or(Error::RootNotFound)?;

        let mut pending = Vec::new();
        for entry in entries[..known].iter().rev() {
            match entry.action {
                LogAction::InsertLeaf { leaf_hmac } => self.update(entry.label, leaf_hmac)?,
                LogAction::RemoveLeaf => {
                    self.remove(entry.label);
                }
                LogAction::ResetTree => self.leaves.clear(),
                LogAction::Auth { .. } => pending.push(*entry),
                LogAction::Empty => {}
            }
        }
        Ok(pending)
    }
}

/// frame `request` for the wire
pub fn encode_request(request: &Request, version: u8) -> Result<Vec<u8>> {
    request.to_bytes(version)
}

/// parse the engine's answer to `request`
pub fn parse_response(request: &Request, bytes: &[u8]) -> Result<Response> {
    Response::from_bytes(bytes, request.message_type())
}
