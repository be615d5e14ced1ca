//! pinweaver request engine
//!
//! the engine holds one tree: its shape, keys and current root. every
//! request is validated and executed in one call; no state survives
//! between calls except the root, which moves in lock-step with the
//! newest replay log entry.
//!
//! auth attempts are committed to the log before any secret is put into
//! the response, so cutting power after seeing an answer cannot make a
//! guess go uncounted.

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::codec::{decrypt_leaf, encrypt_leaf, rewrap_leaf, verify_hmac};
use crate::crypto::{Hash, HASH_SIZE};
use crate::error::{result_code, SUCCESS};
use crate::leaf::{LeafData, LeafPublicData, Timestamp, WrappedLeaf, SECRET_SIZE};
use crate::log::{self, LogAction, LogEntry, LogStorage};
use crate::merkle::{authenticate_path, compute_root_hash, validate_label, EMPTY_HASH};
use crate::message::{
    InsertLeafRequest, MessageType, Request, RequestHeader, Response, ResponseData,
    PROTOCOL_VERSION, REQUEST_HEADER_SIZE,
};
use crate::pcr::validate_pcr_criteria;
use crate::platform::Platform;
use crate::rate_limit::{test_rate_limit, validate_delay_schedule};
use crate::storage::{NvStorage, TREE_VAR};
use crate::tree::{validate_tree_parameters, MerkleTree, TreeParams, TreeRecord};
use crate::{Error, Result};

/// uptime below which a load counts as a fresh restart
pub const RESTART_THRESHOLD_SECS: u64 = 10;

/// result of one request: a result code plus whatever payload goes with it
///
/// some failures still carry data (a rate limited attempt reports its wait,
/// a wrong pin returns the updated leaf).
pub struct Outcome {
    pub result: Result<()>,
    pub data: ResponseData,
}

impl Outcome {
    fn err(e: Error) -> Self {
        Self {
            result: Err(e),
            data: ResponseData::None,
        }
    }
}

impl From<Result<ResponseData>> for Outcome {
    fn from(r: Result<ResponseData>) -> Self {
        match r {
            Ok(data) => Self {
                result: Ok(()),
                data,
            },
            Err(e) => Self::err(e),
        }
    }
}

/// one row of the auth outcome table
struct AuthRow<'a> {
    attempts: u32,
    result: Result<()>,
    high_entropy_secret: &'a [u8; SECRET_SIZE],
    reset_secret: &'a [u8; SECRET_SIZE],
}

/// brute-force resistant credential engine
pub struct PinWeaver<P: Platform, S: NvStorage> {
    platform: P,
    storage: S,
    tree: Option<MerkleTree>,
    restart_count: u32,
}

impl<P: Platform, S: NvStorage> PinWeaver<P, S> {
    /// create an engine without a loaded tree
    pub fn new(platform: P, storage: S) -> Self {
        Self {
            platform,
            storage,
            tree: None,
            restart_count: 0,
        }
    }

    /// create an engine and load whatever tree storage holds
    ///
    /// a failed load leaves the engine without a tree; only reset_tree
    /// recovers from that.
    pub fn open(platform: P, storage: S) -> Self {
        let mut engine = Self::new(platform, storage);
        if let Err(e) = engine.load() {
            warn!("no usable tree loaded: {}", e);
        }
        engine
    }

    /// create an engine for looking at persisted state only
    ///
    /// unlike [`Self::open`] this never counts a restart, so storage is left
    /// exactly as it was.
    pub fn inspect(platform: P, storage: S) -> Self {
        let mut engine = Self::new(platform, storage);
        if let Err(e) = engine.load_read_only() {
            warn!("no usable tree loaded: {}", e);
        }
        engine
    }

    /// load the tree record and root from storage
    pub fn load(&mut self) -> Result<()> {
        self.load_tree(true)
    }

    /// load without restart detection; nothing is written
    pub fn load_read_only(&mut self) -> Result<()> {
        self.load_tree(false)
    }

    fn load_tree(&mut self, count_restart: bool) -> Result<()> {
        info!("loading tree");
        self.tree = None;

        let bytes = self.storage.get(TREE_VAR)?.ok_or(Error::NvEmpty)?;
        let record = TreeRecord::from_bytes(&bytes)?;
        let mut log = LogStorage::load(&self.storage)?;
        let tree = MerkleTree::restore(&self.platform, &record, log.root())?;

        // a short uptime means the boot clock was reset under us
        if count_restart && self.platform.uptime_secs() < RESTART_THRESHOLD_SECS {
            log.restart_count = log.restart_count.wrapping_add(1);
            log.store(&self.storage)?;
            warn!("restart detected, restart_count = {}", log.restart_count);
        }
        self.restart_count = log.restart_count;
        self.tree = Some(tree);

        info!(
            "loaded tree: bits_per_level={} height={} restart_count={}",
            record.params.bits_per_level, record.params.height, self.restart_count
        );
        Ok(())
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// loaded tree, if any
    pub fn tree(&self) -> Option<&MerkleTree> {
        self.tree.as_ref()
    }

    pub fn params(&self) -> Option<TreeParams> {
        self.tree.as_ref().map(|t| t.params)
    }

    /// current root, zero when no tree is loaded
    pub fn root(&self) -> Hash {
        self.tree.as_ref().map_or([0u8; HASH_SIZE], |t| t.root)
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// the persisted replay log
    pub fn log(&self) -> Result<LogStorage> {
        LogStorage::load(&self.storage)
    }

    /// handle one framed request and produce the framed response
    ///
    /// never fails: malformed input is answered with an error code and the
    /// current root.
    pub fn handle_request(&mut self, bytes: &[u8]) -> Vec<u8> {
        if bytes.len() < REQUEST_HEADER_SIZE {
            debug!("request shorter than a header ({} bytes)", bytes.len());
            return self.error_response(PROTOCOL_VERSION, &Error::LengthInvalid);
        }

        let (version, outcome) = match RequestHeader::from_bytes(bytes) {
            Ok(header) => {
                let outcome = self.handle_framed(&header, &bytes[REQUEST_HEADER_SIZE..]);
                (header.version, outcome)
            }
            Err(e) => (PROTOCOL_VERSION, Outcome::err(e)),
        };

        let code = result_code(&outcome.result);
        Response::new(version, code, self.root(), outcome.data).to_bytes()
    }

    /// framed answer carrying only `error` and the current root
    pub fn error_response(&self, version: u8, error: &Error) -> Vec<u8> {
        Response::new(version, error.code(), self.root(), ResponseData::None).to_bytes()
    }

    fn handle_framed(&mut self, header: &RequestHeader, payload: &[u8]) -> Outcome {
        if payload.len() != header.data_length as usize {
            debug!(
                "header size mismatch {} != {}",
                payload.len(),
                header.data_length
            );
            return Outcome::err(Error::LengthInvalid);
        }
        if header.version > PROTOCOL_VERSION {
            return Outcome::err(Error::VersionMismatch);
        }
        let kind = match MessageType::try_from(header.kind) {
            Ok(MessageType::Invalid) | Err(_) => return Outcome::err(Error::TypeInvalid),
            Ok(kind) => kind,
        };

        // everything except reset_tree is sized by the loaded tree
        let aux_hash_count = match (kind, &self.tree) {
            (MessageType::ResetTree, _) => 0,
            (_, Some(tree)) => tree.params.aux_hash_count(),
            (_, None) => return Outcome::err(Error::TreeInvalid),
        };

        match Request::decode(header.version, kind, payload, aux_hash_count) {
            Ok(request) => self.execute(&request),
            Err(e) => Outcome::err(e),
        }
    }

    /// run a decoded request
    pub fn execute(&mut self, request: &Request) -> Outcome {
        let outcome: Outcome = match request {
            Request::ResetTree {
                bits_per_level,
                height,
            } => self
                .reset_tree(*bits_per_level, *height)
                .map(|_| ResponseData::None)
                .into(),
            Request::InsertLeaf(req) => self.insert_leaf(req).into(),
            Request::RemoveLeaf {
                label,
                leaf_hmac,
                path_hashes,
            } => self
                .remove_leaf(*label, leaf_hmac, path_hashes)
                .map(|_| ResponseData::None)
                .into(),
            Request::TryAuth {
                low_entropy_secret,
                leaf,
                path_hashes,
            } => self.try_auth(low_entropy_secret, leaf, path_hashes),
            Request::ResetAuth {
                reset_secret,
                leaf,
                path_hashes,
            } => self.reset_auth(reset_secret, leaf, path_hashes).into(),
            Request::GetLog { root } => self.get_log(root).into(),
            Request::LogReplay {
                log_root,
                leaf,
                path_hashes,
            } => self.log_replay(log_root, leaf, path_hashes).into(),
        };

        debug!(
            "{:?} -> {:#x}",
            request.message_type(),
            result_code(&outcome.result)
        );
        outcome
    }

    fn tree_ref(&self) -> Result<&MerkleTree> {
        self.tree.as_ref().ok_or(Error::TreeInvalid)
    }

    /// adopt a root after its log entry is durable
    fn commit_root(&mut self, root: Hash) {
        if let Some(tree) = self.tree.as_mut() {
            tree.root = root;
        }
    }

    /// current boot relative time
    fn now(&self) -> Timestamp {
        Timestamp {
            boot_count: self.restart_count,
            timer_value: self.platform.uptime_secs(),
        }
    }

    /// authenticate a caller supplied leaf against the root, then decrypt it
    fn unwrap_leaf(
        &self,
        tree: &MerkleTree,
        leaf: &WrappedLeaf,
        path_hashes: &[Hash],
    ) -> Result<LeafData> {
        let label = leaf.public_data()?.label;
        validate_label(&tree.params, label)?;
        authenticate_path(&tree.params, &tree.root, label, path_hashes, &leaf.hmac)?;
        verify_hmac(&tree.keys, leaf)?;
        decrypt_leaf(&tree.keys, leaf)
    }

    fn reset_tree(&mut self, bits_per_level: u8, height: u8) -> Result<()> {
        validate_tree_parameters(bits_per_level, height)?;
        let params = TreeParams {
            bits_per_level,
            height,
        };
        let tree = MerkleTree::create(&self.platform, params)?;

        self.storage.set(TREE_VAR, &tree.record().to_bytes())?;
        LogStorage::new(tree.root).store(&self.storage)?;

        info!(
            "tree reset: bits_per_level={} height={} root={}",
            bits_per_level,
            height,
            hex::encode(tree.root)
        );
        self.restart_count = 0;
        self.tree = Some(tree);
        Ok(())
    }

    fn insert_leaf(&mut self, req: &InsertLeafRequest) -> Result<ResponseData> {
        let tree = self.tree_ref()?;
        validate_label(&tree.params, req.label)?;
        authenticate_path(&tree.params, &tree.root, req.label, &req.path_hashes, &EMPTY_HASH)?;
        validate_delay_schedule(&req.delay_schedule)?;

        let leaf = LeafData {
            public: LeafPublicData::new(req.label, req.delay_schedule, req.valid_pcr_criteria),
            sensitive: req.sensitive.clone(),
        };
        let wrapped = encrypt_leaf(&self.platform, &tree.keys, &leaf)?;
        let new_root = compute_root_hash(&tree.params, req.label, &req.path_hashes, &wrapped.hmac);

        log::append(
            &self.storage,
            LogEntry {
                root: new_root,
                label: req.label,
                action: LogAction::InsertLeaf {
                    leaf_hmac: wrapped.hmac,
                },
            },
        )?;
        self.commit_root(new_root);

        Ok(ResponseData::InsertLeaf { leaf: wrapped })
    }

    fn remove_leaf(&mut self, label: u64, leaf_hmac: &Hash, path_hashes: &[Hash]) -> Result<()> {
        let tree = self.tree_ref()?;
        validate_label(&tree.params, label)?;
        authenticate_path(&tree.params, &tree.root, label, path_hashes, leaf_hmac)?;

        let new_root = compute_root_hash(&tree.params, label, path_hashes, &EMPTY_HASH);
        log::append(
            &self.storage,
            LogEntry {
                root: new_root,
                label,
                action: LogAction::RemoveLeaf,
            },
        )?;
        self.commit_root(new_root);
        Ok(())
    }

    fn try_auth(
        &mut self,
        low_entropy_secret: &[u8; SECRET_SIZE],
        leaf: &WrappedLeaf,
        path_hashes: &[Hash],
    ) -> Outcome {
        let tree = match self.tree_ref() {
            Ok(tree) => tree,
            Err(e) => return Outcome::err(e),
        };
        let mut leaf_data = match self.unwrap_leaf(tree, leaf, path_hashes) {
            Ok(data) => data,
            Err(e) => return Outcome::err(e),
        };
        let criteria = &leaf_data.public.valid_pcr_criteria;
        if let Err(e) = validate_pcr_criteria(&self.platform, criteria) {
            return Outcome::err(e);
        }

        let now = self.now();
        if let Err(e) = test_rate_limit(&leaf_data.public, &now) {
            let seconds_to_wait = match e {
                Error::RateLimitReached { seconds_to_wait } => seconds_to_wait,
                _ => 0,
            };
            return Outcome {
                result: Err(e),
                data: ResponseData::rate_limited(seconds_to_wait),
            };
        }
        leaf_data.public.timestamp = now;

        // from here on both outcomes run the same code, only the table row
        // picked by the comparison differs
        let zeros = [0u8; SECRET_SIZE];
        let table = [
            AuthRow {
                attempts: leaf_data.public.attempt_count.saturating_add(1),
                result: Err(Error::LowEntropyAuthFailed),
                high_entropy_secret: &zeros,
                reset_secret: &zeros,
            },
            AuthRow {
                attempts: 0,
                result: Ok(()),
                high_entropy_secret: &leaf_data.sensitive.high_entropy_secret,
                reset_secret: &leaf_data.sensitive.reset_secret,
            },
        ];
        let matched = low_entropy_secret
            .ct_eq(&leaf_data.sensitive.low_entropy_secret)
            .unwrap_u8() as usize;
        let row = &table[matched];

        let mut public = leaf_data.public.clone();
        public.attempt_count = row.attempts;

        let step = rewrap_leaf(&tree.keys, &public, leaf).and_then(|wrapped| {
            let new_root =
                compute_root_hash(&tree.params, public.label, path_hashes, &wrapped.hmac);
            log::append(
                &self.storage,
                LogEntry {
                    root: new_root,
                    label: public.label,
                    action: LogAction::Auth {
                        return_code: result_code(&row.result),
                        timestamp: now,
                    },
                },
            )?;
            Ok((wrapped, new_root))
        });
        let (wrapped, new_root) = match step {
            Ok(v) => v,
            Err(e) => return Outcome::err(e),
        };

        // the attempt is durable, secrets may be released now
        let data = ResponseData::TryAuth {
            seconds_to_wait: 0,
            high_entropy_secret: Zeroizing::new(*row.high_entropy_secret),
            reset_secret: Zeroizing::new(*row.reset_secret),
            leaf: Some(wrapped),
        };
        let result = row.result.clone();
        self.commit_root(new_root);

        Outcome { result, data }
    }

    fn reset_auth(
        &mut self,
        reset_secret: &[u8; SECRET_SIZE],
        leaf: &WrappedLeaf,
        path_hashes: &[Hash],
    ) -> Result<ResponseData> {
        let tree = self.tree_ref()?;
        let leaf_data = self.unwrap_leaf(tree, leaf, path_hashes)?;

        if !bool::from(reset_secret.ct_eq(&leaf_data.sensitive.reset_secret)) {
            return Err(Error::ResetAuthFailed);
        }

        let mut public = leaf_data.public.clone();
        public.attempt_count = 0;

        let wrapped = rewrap_leaf(&tree.keys, &public, leaf)?;
        let new_root = compute_root_hash(&tree.params, public.label, path_hashes, &wrapped.hmac);
        log::append(
            &self.storage,
            LogEntry {
                root: new_root,
                label: public.label,
                action: LogAction::Auth {
                    return_code: SUCCESS,
                    timestamp: public.timestamp,
                },
            },
        )?;
        let high_entropy_secret = Zeroizing::new(leaf_data.sensitive.high_entropy_secret);
        self.commit_root(new_root);

        Ok(ResponseData::ResetAuth {
            high_entropy_secret,
            leaf: wrapped,
        })
    }

    fn get_log(&self, root: &Hash) -> Result<ResponseData> {
        self.tree_ref()?;
        let log = LogStorage::load(&self.storage)?;

        // an unknown root gets the whole log so a far behind caller can
        // still work out where its copy stands
        let entries = match log.relevant_index(root) {
            Some(index) => log.entries[..=index].to_vec(),
            None => Vec::new(),
        };
        Ok(ResponseData::GetLog { entries })
    }

    /// bring a stale leaf up to a logged auth outcome
    ///
    /// the path is not checked against the current root; instead the
    /// rebuilt leaf must land exactly on the root the log entry recorded.
    fn log_replay(
        &self,
        log_root: &Hash,
        leaf: &WrappedLeaf,
        path_hashes: &[Hash],
    ) -> Result<ResponseData> {
        let tree = self.tree_ref()?;
        let log = LogStorage::load(&self.storage)?;
        let entry = log.entries[log.find_entry(log_root)?];

        let (return_code, timestamp) = match entry.action {
            LogAction::Auth {
                return_code,
                timestamp,
            } => (return_code, timestamp),
            _ => return Err(Error::TypeInvalid),
        };

        verify_hmac(&tree.keys, leaf)?;
        let leaf_data = decrypt_leaf(&tree.keys, leaf)?;
        if leaf_data.public.label != entry.label {
            return Err(Error::LabelInvalid);
        }

        let mut public = leaf_data.public.clone();
        public.attempt_count = if return_code == SUCCESS {
            0
        } else {
            public.attempt_count.saturating_add(1)
        };
        public.timestamp = timestamp;

        let wrapped = rewrap_leaf(&tree.keys, &public, leaf)?;
        let root = compute_root_hash(&tree.params, public.label, path_hashes, &wrapped.hmac);
        if root != entry.root {
            return Err(Error::PathAuthFailed);
        }
        Ok(ResponseData::LogReplay { leaf: wrapped })
    }
}
