//! # pinweaver
//!
//! brute-force resistant low-entropy credential checking.
//!
//! a credential (pin) is bound to a high-entropy secret and a reset secret
//! inside an encrypted leaf. the caller stores the leaves; the engine keeps
//! only the root of a merkle tree over their hmacs, so any stale, forged or
//! replayed leaf fails to authenticate. every attempt updates the leaf's
//! failure count and timestamp and moves the root, and a delay schedule per
//! leaf throttles guessing.
//!
//! ## architecture
//!
//! ```text
//!   caller (ClientTree)                 engine (PinWeaver)
//! ┌──────────────────────┐           ┌──────────────────────────┐
//! │ wrapped leaves       │  request  │ tree params + keys       │
//! │ hmac per label       │ ────────► │ root                     │
//! │ path hashes          │ ◄──────── │                          │
//! └──────────────────────┘  response └────┬──────────────┬──────┘
//!                                         │              │
//!                                  ┌──────▼─────┐  ┌─────▼──────┐
//!                                  │  platform  │  │  storage   │
//!                                  │ seed, kdf, │  │ tree rec,  │
//!                                  │ clock, pcr │  │ replay log │
//!                                  └────────────┘  └────────────┘
//! ```
//!
//! ## security properties
//!
//! - the root is only adopted after its log entry is persisted
//! - an attempt is logged before any secret leaves the engine
//! - pin comparison and both outcomes take the same code path
//! - leaves are encrypted with chacha20 and authenticated with hmac-sha256
//!   under keys derived from a device seed and a per-tree nonce
//!
//! ## usage
//!
//! ```rust,ignore
//! use pinweaver::{
//!     parse_response, ClientTree, MemoryStorage, PinWeaver, Request, SoftwarePlatform, TreeParams,
//!     PROTOCOL_VERSION,
//! };
//!
//! let mut engine = PinWeaver::open(SoftwarePlatform::new(), MemoryStorage::new());
//! let mut tree = ClientTree::new(TreeParams::new(2, 6)?);
//!
//! let request = Request::ResetTree { bits_per_level: 2, height: 6 };
//! let response = engine.handle_request(&request.to_bytes(PROTOCOL_VERSION)?);
//! tree.apply(&request, &parse_response(&request, &response)?)?;
//! ```

pub mod client;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod leaf;
pub mod log;
pub mod merkle;
pub mod message;
pub mod pcr;
pub mod platform;
pub mod protocol;
pub mod rate_limit;
pub mod storage;
pub mod tree;

pub use client::{encode_request, parse_response, ClientTree};
pub use error::{Error, Result};
pub use leaf::{
    delay_schedule, DelaySchedule, LeafPublicData, LeafSensitiveData, PcrCriteria, Timestamp,
    ValidPcrValue, WrappedLeaf,
};
pub use log::{LogAction, LogEntry, LogStorage};
pub use message::{MessageType, Request, Response, ResponseData, PROTOCOL_VERSION};
pub use platform::Platform;
pub use protocol::{Outcome, PinWeaver};
pub use storage::{MemoryStorage, NvStorage};
pub use tree::TreeParams;

#[cfg(feature = "software")]
pub use platform::software::SoftwarePlatform;

#[cfg(feature = "sled")]
pub use storage::SledStorage;
