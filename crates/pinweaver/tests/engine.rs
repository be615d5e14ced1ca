//! end to end tests driving the engine through its wire interface

use std::sync::Arc;
use std::time::{Duration, Instant};

use pinweaver::codec::{compute_hmac, encrypt_leaf};
use pinweaver::leaf::{
    LeafData, LeafHeader, BLOCK_ATTEMPTS, PUBLIC_DATA_SIZE, PUBLIC_DATA_SIZE_V0, SECRET_SIZE,
};
use pinweaver::log::LOG_ENTRY_COUNT;
use pinweaver::merkle::compute_root_hash;
use pinweaver::message::{ResponseHeader, RESPONSE_HEADER_SIZE};
use pinweaver::{
    delay_schedule, encode_request, parse_response, ClientTree, DelaySchedule, Error,
    LeafPublicData, LeafSensitiveData, LogAction, LogEntry, MemoryStorage, NvStorage, PcrCriteria,
    PinWeaver, Request, Response, ResponseData, SoftwarePlatform, TreeParams, ValidPcrValue,
    WrappedLeaf, PROTOCOL_VERSION,
};

const PIN: [u8; SECRET_SIZE] = [0x11; SECRET_SIZE];
const WRONG_PIN: [u8; SECRET_SIZE] = [0x99; SECRET_SIZE];
const HIGH_ENTROPY: [u8; SECRET_SIZE] = [0x22; SECRET_SIZE];
const RESET_SECRET: [u8; SECRET_SIZE] = [0x33; SECRET_SIZE];

type Engine = PinWeaver<Arc<SoftwarePlatform>, Arc<MemoryStorage>>;

struct Harness {
    platform: Arc<SoftwarePlatform>,
    storage: Arc<MemoryStorage>,
    engine: Engine,
    tree: ClientTree,
}

impl Harness {
    fn new() -> Self {
        let platform = Arc::new(SoftwarePlatform::new());
        // well past the restart threshold
        platform.advance(1000);
        let storage = Arc::new(MemoryStorage::new());
        let engine = PinWeaver::open(platform.clone(), storage.clone());

        let params = TreeParams::new(2, 6).unwrap();
        let mut harness = Self {
            platform,
            storage,
            engine,
            tree: ClientTree::new(params),
        };
        let request = Request::ResetTree {
            bits_per_level: 2,
            height: 6,
        };
        let (response, _) = harness.exchange(&request);
        response.result().unwrap();
        harness
    }

    fn send_version(&mut self, request: &Request, version: u8) -> Response {
        let bytes = self.engine.handle_request(&encode_request(request, version).unwrap());
        parse_response(request, &bytes).unwrap()
    }

    fn send(&mut self, request: &Request) -> Response {
        self.send_version(request, PROTOCOL_VERSION)
    }

    /// send and fold the answer into the caller mirror
    fn exchange(&mut self, request: &Request) -> (Response, Option<WrappedLeaf>) {
        let response = self.send(request);
        let leaf = self.tree.apply(request, &response).ok().flatten();
        (response, leaf)
    }

    fn enroll_with(
        &mut self,
        label: u64,
        schedule: DelaySchedule,
        pcr: PcrCriteria,
    ) -> WrappedLeaf {
        let sensitive = LeafSensitiveData::new(PIN, HIGH_ENTROPY, RESET_SECRET);
        let request = self.tree.insert_request(label, schedule, sensitive, pcr).unwrap();
        let (response, leaf) = self.exchange(&request);
        response.result().unwrap();
        leaf.unwrap()
    }

    fn enroll(&mut self, label: u64, schedule: DelaySchedule) -> WrappedLeaf {
        self.enroll_with(label, schedule, [ValidPcrValue::default(); 2])
    }

    fn try_auth(
        &mut self,
        leaf: &WrappedLeaf,
        pin: &[u8; SECRET_SIZE],
    ) -> (Response, Option<WrappedLeaf>) {
        let request = self.tree.try_auth_request(pin, leaf).unwrap();
        self.exchange(&request)
    }

    /// wrap `public` under the tree's keys as a current version leaf
    fn wrap(&self, public: LeafPublicData) -> WrappedLeaf {
        let leaf = LeafData {
            public,
            sensitive: LeafSensitiveData::new(PIN, HIGH_ENTROPY, RESET_SECRET),
        };
        let keys = &self.engine.tree().unwrap().keys;
        encrypt_leaf(self.engine.platform(), keys, &leaf).unwrap()
    }

    /// re-tag `leaf` and make it part of the tree behind the engine's back
    fn plant(&mut self, mut leaf: WrappedLeaf) -> WrappedLeaf {
        leaf.hmac = compute_hmac(&self.engine.tree().unwrap().keys, &leaf).unwrap();
        let label = leaf.public_data().unwrap().label;
        self.tree.update(label, leaf.hmac).unwrap();

        let mut log = self.engine.log().unwrap();
        log.push(LogEntry {
            root: self.tree.root(),
            label,
            action: LogAction::InsertLeaf { leaf_hmac: leaf.hmac },
        });
        log.store(&self.storage).unwrap();
        self.engine = PinWeaver::open(self.platform.clone(), self.storage.clone());
        self.assert_in_sync();
        leaf
    }

    /// newest logged root
    fn last_logged_root(&self) -> [u8; 32] {
        self.engine.log().unwrap().root()
    }

    fn assert_in_sync(&self) {
        assert_eq!(self.tree.root(), self.engine.root());
        assert_eq!(self.engine.log().unwrap().root(), self.engine.root());
    }
}

fn attempts(leaf: &WrappedLeaf) -> u32 {
    leaf.public_data().unwrap().attempt_count
}

fn released_secrets(response: &Response) -> ([u8; SECRET_SIZE], [u8; SECRET_SIZE]) {
    match &response.data {
        ResponseData::TryAuth {
            high_entropy_secret,
            reset_secret,
            ..
        } => (**high_entropy_secret, **reset_secret),
        _ => panic!("not a try_auth response"),
    }
}

fn wait_of(response: &Response) -> u32 {
    match response.result() {
        Err(Error::RateLimitReached { seconds_to_wait }) => seconds_to_wait,
        other => panic!("expected rate limit, got {:?}", other),
    }
}

#[test]
fn test_round_trip() {
    let mut h = Harness::new();
    let leaf = h.enroll(5, delay_schedule(&[(5, 20)]));
    h.assert_in_sync();

    let (response, new_leaf) = h.try_auth(&leaf, &PIN);
    response.result().unwrap();
    assert_eq!(released_secrets(&response), (HIGH_ENTROPY, RESET_SECRET));

    let new_leaf = new_leaf.unwrap();
    assert_eq!(attempts(&new_leaf), 0);
    assert_eq!(new_leaf.public_data().unwrap().label, 5);
    assert_eq!(response.header.root, h.engine.root());
    h.assert_in_sync();
}

#[test]
fn test_wrong_pin_counts_and_releases_nothing() {
    let mut h = Harness::new();
    let mut leaf = h.enroll(9, delay_schedule(&[(50, 10)]));

    for k in 1..=5 {
        let (response, new_leaf) = h.try_auth(&leaf, &WRONG_PIN);
        assert_eq!(response.result(), Err(Error::LowEntropyAuthFailed));
        assert_eq!(released_secrets(&response), ([0; SECRET_SIZE], [0; SECRET_SIZE]));

        leaf = new_leaf.unwrap();
        assert_eq!(attempts(&leaf), k);
        h.assert_in_sync();
    }

    // the attempt was logged with its outcome
    let log = h.engine.log().unwrap();
    match log.entries[0].action {
        LogAction::Auth { return_code, .. } => {
            assert_eq!(return_code, Error::LowEntropyAuthFailed.code())
        }
        other => panic!("unexpected log action {:?}", other),
    }

    let (response, leaf) = h.try_auth(&leaf, &PIN);
    response.result().unwrap();
    assert_eq!(attempts(&leaf.unwrap()), 0);
}

#[test]
fn test_old_leaf_copy_rejected() {
    let mut h = Harness::new();
    let leaf = h.enroll(3, delay_schedule(&[(50, 10)]));
    h.try_auth(&leaf, &WRONG_PIN);

    // the pre-attempt copy no longer hashes into the root
    let (response, _) = h.try_auth(&leaf, &PIN);
    assert_eq!(response.result(), Err(Error::PathAuthFailed));
}

#[test]
fn test_tamper_detection() {
    let mut h = Harness::new();
    let leaf = h.enroll(1, delay_schedule(&[(5, 20)]));
    let root = h.engine.root();

    // a flipped tag no longer matches the tree
    let mut bad_tag = leaf.clone();
    bad_tag.hmac[7] ^= 0x01;
    for pin in [&PIN, &WRONG_PIN] {
        let request = h.tree.try_auth_request(pin, &bad_tag).unwrap();
        assert_eq!(h.send(&request).result(), Err(Error::PathAuthFailed));
    }
    let request = h.tree.reset_auth_request(&RESET_SECRET, &bad_tag).unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::PathAuthFailed));
    let request = Request::RemoveLeaf {
        label: 1,
        leaf_hmac: bad_tag.hmac,
        path_hashes: h.tree.path(1).unwrap(),
    };
    assert_eq!(h.send(&request).result(), Err(Error::PathAuthFailed));

    // a flipped body byte under the original tag fails the hmac check
    let mut bad_cipher = leaf.clone();
    bad_cipher.cipher_text[0] ^= 0x80;
    let request = h.tree.try_auth_request(&PIN, &bad_cipher).unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::HmacAuthFailed));

    let mut bad_public = leaf.clone();
    bad_public.public[100] ^= 0x04;
    let request = h.tree.reset_auth_request(&RESET_SECRET, &bad_public).unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::HmacAuthFailed));

    assert_eq!(h.engine.root(), root);
}

#[test]
fn test_rate_limiting() {
    let mut h = Harness::new();
    let mut leaf = h.enroll(2, delay_schedule(&[(3, 10), (5, BLOCK_ATTEMPTS)]));

    for _ in 0..3 {
        let (response, new_leaf) = h.try_auth(&leaf, &WRONG_PIN);
        assert_eq!(response.result(), Err(Error::LowEntropyAuthFailed));
        leaf = new_leaf.unwrap();
    }
    assert_eq!(attempts(&leaf), 3);

    h.platform.advance(4);
    let root = h.engine.root();
    let (response, none) = h.try_auth(&leaf, &PIN);
    let wait = wait_of(&response);
    assert!((1..=6).contains(&wait), "wait {}", wait);
    assert!(none.is_none());
    assert_eq!(released_secrets(&response), ([0; SECRET_SIZE], [0; SECRET_SIZE]));
    assert_eq!(h.engine.root(), root);

    h.platform.advance(10);
    let (response, new_leaf) = h.try_auth(&leaf, &WRONG_PIN);
    assert_eq!(response.result(), Err(Error::LowEntropyAuthFailed));
    leaf = new_leaf.unwrap();

    h.platform.advance(10);
    let (_, new_leaf) = h.try_auth(&leaf, &WRONG_PIN);
    leaf = new_leaf.unwrap();
    assert_eq!(attempts(&leaf), 5);

    // blocked for good, the right pin included
    h.platform.advance(1_000_000);
    for pin in [&PIN, &WRONG_PIN] {
        let (response, _) = h.try_auth(&leaf, pin);
        assert_eq!(wait_of(&response), BLOCK_ATTEMPTS);
    }
}

#[test]
fn test_root_consistency() {
    let mut h = Harness::new();
    let schedule = delay_schedule(&[(50, 10)]);
    let a = h.enroll(0, schedule);
    let b = h.enroll(17, schedule);
    let c = h.enroll(4095, schedule);
    h.assert_in_sync();

    let (_, a) = h.try_auth(&a, &WRONG_PIN);
    let a = a.unwrap();
    let (_, c) = h.try_auth(&c, &PIN);
    let c = c.unwrap();
    h.assert_in_sync();

    let request = h.tree.remove_request(17).unwrap();
    let (response, _) = h.exchange(&request);
    response.result().unwrap();
    h.assert_in_sync();

    let params = h.tree.params();
    for leaf in [&a, &c] {
        let label = leaf.public_data().unwrap().label;
        let path = h.tree.path(label).unwrap();
        assert_eq!(compute_root_hash(&params, label, &path, &leaf.hmac), h.engine.root());
    }

    // the removed leaf is gone for good
    let (response, _) = h.try_auth(&b, &PIN);
    assert_eq!(response.result(), Err(Error::PathAuthFailed));
}

#[test]
fn test_insert_needs_empty_slot_and_valid_schedule() {
    let mut h = Harness::new();
    h.enroll(8, delay_schedule(&[(5, 20)]));

    // pretend the slot is still empty
    let request = Request::InsertLeaf(pinweaver::message::InsertLeafRequest {
        label: 8,
        delay_schedule: delay_schedule(&[(5, 20)]),
        sensitive: LeafSensitiveData::new(PIN, HIGH_ENTROPY, RESET_SECRET),
        valid_pcr_criteria: [ValidPcrValue::default(); 2],
        path_hashes: h.tree.path(8).unwrap(),
    });
    assert_eq!(h.send(&request).result(), Err(Error::PathAuthFailed));

    let sensitive = LeafSensitiveData::new(PIN, HIGH_ENTROPY, RESET_SECRET);
    let schedule = delay_schedule(&[(5, 20), (4, 30)]);
    let request = h
        .tree
        .insert_request(9, schedule, sensitive, [ValidPcrValue::default(); 2])
        .unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::DelayScheduleInvalid));
    h.assert_in_sync();
}

#[test]
fn test_reset_auth() {
    let mut h = Harness::new();
    let mut leaf = h.enroll(6, delay_schedule(&[(2, 30)]));
    for _ in 0..2 {
        let (_, new_leaf) = h.try_auth(&leaf, &WRONG_PIN);
        leaf = new_leaf.unwrap();
    }

    let request = h.tree.reset_auth_request(&WRONG_PIN, &leaf).unwrap();
    let (response, none) = h.exchange(&request);
    assert_eq!(response.result(), Err(Error::ResetAuthFailed));
    assert!(none.is_none());

    let request = h.tree.reset_auth_request(&RESET_SECRET, &leaf).unwrap();
    let (response, new_leaf) = h.exchange(&request);
    response.result().unwrap();
    match &response.data {
        ResponseData::ResetAuth {
            high_entropy_secret, ..
        } => assert_eq!(**high_entropy_secret, HIGH_ENTROPY),
        _ => panic!("not a reset_auth response"),
    }
    let leaf = new_leaf.unwrap();
    assert_eq!(attempts(&leaf), 0);
    h.assert_in_sync();

    // the delay is lifted along with the count
    let (response, _) = h.try_auth(&leaf, &PIN);
    response.result().unwrap();
}

#[test]
fn test_replay_repair() {
    let mut h = Harness::new();
    let stale = h.enroll(12, delay_schedule(&[(50, 10)]));
    let synced_root = h.tree.root();

    // the engine answers but the caller never sees it
    let request = h.tree.try_auth_request(&WRONG_PIN, &stale).unwrap();
    let response = h.send(&request);
    assert_eq!(response.result(), Err(Error::LowEntropyAuthFailed));
    assert_ne!(h.engine.root(), synced_root);

    let request = h.tree.get_log_request();
    let (response, _) = h.exchange(&request);
    let entries = match response.data {
        ResponseData::GetLog { entries } => entries,
        _ => panic!("not a get_log response"),
    };
    assert_eq!(entries.len(), 2);

    let pending = h.tree.catch_up(&entries).unwrap();
    assert_eq!(pending.len(), 1);

    // a non-auth entry cannot be replayed
    let request = h.tree.log_replay_request(synced_root, &stale).unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::TypeInvalid));
    let request = h.tree.log_replay_request([0x5a; 32], &stale).unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::RootNotFound));

    let engine_root = h.engine.root();
    let request = h.tree.log_replay_request(pending[0].root, &stale).unwrap();
    let (response, repaired) = h.exchange(&request);
    response.result().unwrap();
    // replay is read only
    assert_eq!(h.engine.root(), engine_root);

    let repaired = repaired.unwrap();
    assert_eq!(attempts(&repaired), 1);
    let path = h.tree.path(12).unwrap();
    assert_eq!(
        compute_root_hash(&h.tree.params(), 12, &path, &repaired.hmac),
        pending[0].root
    );
    h.assert_in_sync();

    let (response, _) = h.try_auth(&repaired, &PIN);
    response.result().unwrap();
}

#[test]
fn test_get_log_unknown_root_returns_whole_log() {
    let mut h = Harness::new();
    h.enroll(1, delay_schedule(&[(5, 20)]));
    h.enroll(2, delay_schedule(&[(5, 20)]));

    let response = h.send(&Request::GetLog { root: [0xee; 32] });
    response.result().unwrap();
    match response.data {
        ResponseData::GetLog { entries } => {
            assert_eq!(entries.len(), LOG_ENTRY_COUNT);
            assert_eq!(entries[0].root, h.engine.root());
            assert_eq!(entries[0].label, 2);
        }
        _ => panic!("not a get_log response"),
    }
}

#[test]
fn test_pcr_gating() {
    let mut h = Harness::new();
    h.platform.set_pcr_digest([1, 0], [0xaa; 32]);

    let criteria = [
        ValidPcrValue {
            bitmask: [1, 0],
            digest: [0xbb; 32],
        },
        ValidPcrValue::default(),
    ];
    let leaf = h.enroll_with(4, delay_schedule(&[(5, 20)]), criteria);
    let root = h.engine.root();

    let (response, _) = h.try_auth(&leaf, &PIN);
    assert_eq!(response.result(), Err(Error::PcrNotMatch));
    assert_eq!(h.engine.root(), root);

    h.platform.set_pcr_digest([1, 0], [0xbb; 32]);
    let (response, _) = h.try_auth(&leaf, &PIN);
    response.result().unwrap();
    assert_eq!(released_secrets(&response).0, HIGH_ENTROPY);
}

#[test]
fn test_protocol_v0_caller() {
    let mut h = Harness::new();

    let sensitive = LeafSensitiveData::new(PIN, HIGH_ENTROPY, RESET_SECRET);
    let request = h
        .tree
        .insert_request(21, delay_schedule(&[(5, 20)]), sensitive, [ValidPcrValue::default(); 2])
        .unwrap();
    let response = h.send_version(&request, 0);
    assert_eq!(response.header.version, 0);
    response.result().unwrap();
    let leaf = h.tree.apply(&request, &response).unwrap().unwrap();
    assert!(leaf.public_data().unwrap().valid_pcr_criteria[0].is_empty());

    let request = h.tree.try_auth_request(&PIN, &leaf).unwrap();
    let bytes = h.engine.handle_request(&request.to_bytes(0).unwrap());
    let response = parse_response(&request, &bytes).unwrap();
    response.result().unwrap();
    assert_eq!(response.header.version, 0);
    // v0 responses carry no reset secret
    let (high, reset) = released_secrets(&response);
    assert_eq!(high, HIGH_ENTROPY);
    assert_eq!(reset, [0; SECRET_SIZE]);
    assert_eq!(bytes.len(), RESPONSE_HEADER_SIZE + 4 + SECRET_SIZE + leaf.to_bytes().len());
}

#[test]
fn test_storage_failure_keeps_root() {
    let mut h = Harness::new();
    let leaf = h.enroll(30, delay_schedule(&[(5, 20)]));
    let root = h.engine.root();

    h.storage.set_fail_writes(true);
    let request = h.tree.try_auth_request(&PIN, &leaf).unwrap();
    let response = h.send(&request);
    assert!(matches!(response.result(), Err(Error::Storage(_))));
    assert!(matches!(response.data, ResponseData::None));
    assert_eq!(h.engine.root(), root);
    assert_eq!(response.header.root, root);

    // same leaf and proof still work once storage recovers
    h.storage.set_fail_writes(false);
    let (response, _) = h.try_auth(&leaf, &PIN);
    response.result().unwrap();
    h.assert_in_sync();
}

#[test]
fn test_reload_and_restart() {
    let mut h = Harness::new();
    let leaf = h.enroll(40, delay_schedule(&[(1, 30)]));
    let (_, leaf) = h.try_auth(&leaf, &WRONG_PIN);
    let leaf = leaf.unwrap();

    // long uptime: reload keeps root and keys, no restart counted
    h.engine = PinWeaver::open(h.platform.clone(), h.storage.clone());
    assert_eq!(h.engine.restart_count(), 0);
    h.assert_in_sync();

    h.platform.reboot();
    h.engine = PinWeaver::open(h.platform.clone(), h.storage.clone());
    assert_eq!(h.engine.restart_count(), 1);
    h.assert_in_sync();

    // the wait restarts from this boot
    let (response, _) = h.try_auth(&leaf, &PIN);
    let wait = wait_of(&response);
    assert!((25..=30).contains(&wait), "wait {}", wait);

    h.platform.advance(30);
    let (response, _) = h.try_auth(&leaf, &PIN);
    response.result().unwrap();
}

#[test]
fn test_requests_before_reset() {
    let mut engine = PinWeaver::new(SoftwarePlatform::new(), MemoryStorage::new());
    let request = Request::GetLog { root: [0; 32] };
    let bytes = engine.handle_request(&request.to_bytes(PROTOCOL_VERSION).unwrap());
    let response = parse_response(&request, &bytes).unwrap();
    assert_eq!(response.result(), Err(Error::TreeInvalid));
    assert_eq!(response.header.root, [0; 32]);
}

#[test]
fn test_framing_errors() {
    let mut h = Harness::new();
    let root = h.engine.root();

    let header = |bytes: &[u8]| ResponseHeader::from_bytes(bytes).unwrap();

    // shorter than a header
    let response = header(&h.engine.handle_request(&[1, 6]));
    assert_eq!(response.result_code, Error::LengthInvalid.code());
    assert_eq!(response.root, root);

    // declared length disagrees with the payload
    let mut bytes = Request::GetLog { root }.to_bytes(PROTOCOL_VERSION).unwrap();
    bytes.pop();
    let response = header(&h.engine.handle_request(&bytes));
    assert_eq!(response.result_code, Error::LengthInvalid.code());

    // unknown type
    let response = header(&h.engine.handle_request(&[1, 9, 0, 0]));
    assert_eq!(response.result_code, Error::TypeInvalid.code());
    let response = header(&h.engine.handle_request(&[1, 0, 0, 0]));
    assert_eq!(response.result_code, Error::TypeInvalid.code());

    // newer protocol
    let response = header(&h.engine.handle_request(&[2, 6, 0, 0]));
    assert_eq!(response.result_code, Error::VersionMismatch.code());
    assert_eq!(response.version, PROTOCOL_VERSION);

    // path of the wrong size
    let leaf = h.enroll(7, delay_schedule(&[(5, 20)]));
    let mut request = h.tree.try_auth_request(&PIN, &leaf).unwrap();
    if let Request::TryAuth { path_hashes, .. } = &mut request {
        path_hashes.pop();
    }
    let response = header(&h.engine.handle_request(&request.to_bytes(PROTOCOL_VERSION).unwrap()));
    assert_eq!(response.result_code, Error::LengthInvalid.code());
    h.assert_in_sync();
}

#[test]
fn test_bad_tree_record_needs_reset() {
    let mut h = Harness::new();
    h.enroll(1, delay_schedule(&[(5, 20)]));

    h.storage.set(pinweaver::storage::TREE_VAR, &[9u8; 19]).unwrap();
    h.engine = PinWeaver::open(h.platform.clone(), h.storage.clone());
    assert!(h.engine.tree().is_none());
    let response = h.send(&Request::GetLog { root: [0; 32] });
    assert_eq!(response.result(), Err(Error::TreeInvalid));

    h.tree = ClientTree::new(TreeParams::new(1, 4).unwrap());
    let request = Request::ResetTree {
        bits_per_level: 3,
        height: 4,
    };
    let (response, _) = h.exchange(&request);
    response.result().unwrap();
    assert_eq!(h.tree.params(), TreeParams::new(3, 4).unwrap());
    h.assert_in_sync();
}

#[test]
fn test_auth_outcomes_take_similar_time() {
    const ROUNDS: usize = 25;

    let mut h = Harness::new();
    let mut leaf = h.enroll(50, delay_schedule(&[(1000, 1)]));
    let mut success = Vec::with_capacity(ROUNDS);
    let mut failure = Vec::with_capacity(ROUNDS);

    for _ in 0..ROUNDS {
        for (pin, times) in [(&WRONG_PIN, &mut failure), (&PIN, &mut success)] {
            let request = h.tree.try_auth_request(pin, &leaf).unwrap();
            let bytes = request.to_bytes(PROTOCOL_VERSION).unwrap();

            let start = Instant::now();
            let response = h.engine.handle_request(&bytes);
            times.push(start.elapsed());

            let response = parse_response(&request, &response).unwrap();
            leaf = h.tree.apply(&request, &response).unwrap().unwrap();
        }
    }

    let median = |times: &mut Vec<Duration>| {
        times.sort();
        times[times.len() / 2]
    };
    let (ok, bad) = (median(&mut success), median(&mut failure));
    assert!(ok < bad * 3 && bad < ok * 3, "success {:?} failure {:?}", ok, bad);
}

#[test]
fn test_attempt_count_saturates() {
    let mut h = Harness::new();
    let schedule = delay_schedule(&[(1, 10)]);
    let mut public = LeafPublicData::new(60, schedule, [ValidPcrValue::default(); 2]);
    public.attempt_count = u32::MAX;
    let worn = h.wrap(public);
    let worn = h.plant(worn);

    let (response, leaf) = h.try_auth(&worn, &WRONG_PIN);
    assert_eq!(response.result(), Err(Error::LowEntropyAuthFailed));
    let leaf = leaf.unwrap();
    assert_eq!(attempts(&leaf), u32::MAX);
    h.assert_in_sync();

    // the caller misses the next answer and has to replay it
    h.platform.advance(10);
    let request = h.tree.try_auth_request(&WRONG_PIN, &leaf).unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::LowEntropyAuthFailed));
    let engine_root = h.engine.root();

    let request = h.tree.log_replay_request(h.last_logged_root(), &leaf).unwrap();
    let (response, repaired) = h.exchange(&request);
    response.result().unwrap();
    assert_eq!(attempts(&repaired.unwrap()), u32::MAX);
    assert_eq!(h.engine.root(), engine_root);
    h.assert_in_sync();
}

#[test]
fn test_minor_zero_leaf_is_upgraded() {
    let mut h = Harness::new();
    let mut leaf = h.wrap(LeafPublicData::new(
        26,
        delay_schedule(&[(5, 20)]),
        [ValidPcrValue::default(); 2],
    ));
    leaf.header = LeafHeader {
        minor: 0,
        pub_len: PUBLIC_DATA_SIZE_V0 as u16,
        ..LeafHeader::current()
    };
    leaf.public.truncate(PUBLIC_DATA_SIZE_V0);
    let old = h.plant(leaf);

    let (response, upgraded) = h.try_auth(&old, &PIN);
    response.result().unwrap();
    assert_eq!(released_secrets(&response), (HIGH_ENTROPY, RESET_SECRET));

    let upgraded = upgraded.unwrap();
    assert_eq!(upgraded.header, LeafHeader::current());
    assert_eq!(upgraded.public.len(), PUBLIC_DATA_SIZE);
    assert_eq!(upgraded.iv, old.iv);
    let public = upgraded.public_data().unwrap();
    assert_eq!(public.label, 26);
    assert!(public.valid_pcr_criteria.iter().all(|c| c.is_empty()));
    h.assert_in_sync();

    let (response, _) = h.try_auth(&upgraded, &PIN);
    response.result().unwrap();
}

#[test]
fn test_newer_minor_leaf_is_rewritten_at_current_version() {
    let mut h = Harness::new();
    let mut leaf = h.wrap(LeafPublicData::new(
        27,
        delay_schedule(&[(5, 20)]),
        [ValidPcrValue::default(); 2],
    ));
    // a later minor appends fields this engine does not know about
    leaf.public.extend_from_slice(&[0xab; 4]);
    leaf.header = LeafHeader {
        minor: LeafHeader::current().minor + 1,
        pub_len: (PUBLIC_DATA_SIZE + 4) as u16,
        ..LeafHeader::current()
    };
    let newer = h.plant(leaf);

    let (response, rewritten) = h.try_auth(&newer, &WRONG_PIN);
    assert_eq!(response.result(), Err(Error::LowEntropyAuthFailed));
    let rewritten = rewritten.unwrap();
    assert_eq!(rewritten.header, LeafHeader::current());
    assert_eq!(rewritten.public.len(), PUBLIC_DATA_SIZE);
    assert_eq!(attempts(&rewritten), 1);
    h.assert_in_sync();

    let (response, _) = h.try_auth(&rewritten, &PIN);
    response.result().unwrap();
}

#[test]
fn test_replay_rejects_mismatched_leaves() {
    let mut h = Harness::new();
    let first = h.enroll(12, delay_schedule(&[(50, 10)]));
    let other = h.enroll(13, delay_schedule(&[(50, 10)]));
    let (_, second) = h.try_auth(&first, &WRONG_PIN);
    let second = second.unwrap();

    // engine moves to attempt two, the caller never hears of it
    let request = h.tree.try_auth_request(&WRONG_PIN, &second).unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::LowEntropyAuthFailed));
    let entry_root = h.last_logged_root();
    let engine_root = h.engine.root();

    // valid leaf, but not the one the entry is about
    let request = h.tree.log_replay_request(entry_root, &other).unwrap();
    assert_eq!(h.send(&request).result(), Err(Error::LabelInvalid));
    assert_eq!(h.engine.root(), engine_root);

    // a copy two steps behind rebuilds to the wrong root
    let request = h.tree.log_replay_request(entry_root, &first).unwrap();
    let response = h.send(&request);
    assert_eq!(response.result(), Err(Error::PathAuthFailed));
    assert!(matches!(response.data, ResponseData::None));
    assert_eq!(h.engine.root(), engine_root);

    let request = h.tree.log_replay_request(entry_root, &second).unwrap();
    let (response, repaired) = h.exchange(&request);
    response.result().unwrap();
    assert_eq!(attempts(&repaired.unwrap()), 2);
    assert_eq!(h.engine.root(), engine_root);
    h.assert_in_sync();
}

#[test]
fn test_replay_of_reset_auth() {
    let mut h = Harness::new();
    let mut leaf = h.enroll(14, delay_schedule(&[(2, 30)]));
    for _ in 0..2 {
        let (_, new_leaf) = h.try_auth(&leaf, &WRONG_PIN);
        leaf = new_leaf.unwrap();
    }
    assert_eq!(attempts(&leaf), 2);

    let request = h.tree.reset_auth_request(&RESET_SECRET, &leaf).unwrap();
    h.send(&request).result().unwrap();
    let engine_root = h.engine.root();
    match h.engine.log().unwrap().entries[0].action {
        LogAction::Auth { return_code, .. } => assert_eq!(return_code, 0),
        other => panic!("unexpected log action {:?}", other),
    }

    let request = h.tree.log_replay_request(h.last_logged_root(), &leaf).unwrap();
    let (response, repaired) = h.exchange(&request);
    response.result().unwrap();
    let repaired = repaired.unwrap();
    assert_eq!(attempts(&repaired), 0);
    assert_eq!(h.engine.root(), engine_root);
    h.assert_in_sync();

    let (response, _) = h.try_auth(&repaired, &PIN);
    response.result().unwrap();
}
