//! wire messages
//!
//! requests and responses are packed little-endian structures behind a
//! small header:
//!
//! ```text
//! request:  version(1) | type(1) | data_length(2) | payload
//! response: version(1) | data_length(2) | result_code(4) | root(32) | payload
//! ```
//!
//! payloads that carry a wrapped leaf are followed by the leaf's path
//! hashes, so their exact length depends on the tree shape. protocol
//! version 0 callers are served by converting at this boundary: their
//! insert requests lack pcr criteria and their try_auth responses lack the
//! reset secret.

use zeroize::Zeroizing;

use crate::codec::validate_leaf_header;
use crate::crypto::{Hash, HASH_SIZE};
use crate::leaf::{
    read_pcr_criteria, read_schedule, write_pcr_criteria, write_schedule, DelaySchedule,
    LeafHeader, LeafSensitiveData, PcrCriteria, ValidPcrValue, WrappedLeaf, DELAY_SCHEDULE_SIZE,
    MAX_PCR_CRITERIA_COUNT, PCR_CRITERIA_SIZE, SECRET_SIZE, SENSITIVE_DATA_SIZE,
    WRAPPED_LEAF_PREFIX, WRAPPED_LEAF_SIZE,
};
use crate::log::{LogEntry, LOG_ENTRY_SIZE};
use crate::{Error, Result};

/// current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

pub const REQUEST_HEADER_SIZE: usize = 4;
pub const RESPONSE_HEADER_SIZE: usize = 39;

/// bounds-checked little-endian cursor
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::LengthInvalid);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn hashes(&mut self, count: usize) -> Result<Vec<Hash>> {
        (0..count).map(|_| self.array()).collect()
    }

    /// error unless every byte was consumed
    pub fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::LengthInvalid);
        }
        Ok(())
    }
}

/// request kinds, also used as log entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0,
    ResetTree = 1,
    InsertLeaf = 2,
    RemoveLeaf = 3,
    TryAuth = 4,
    ResetAuth = 5,
    GetLog = 6,
    LogReplay = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => MessageType::Invalid,
            1 => MessageType::ResetTree,
            2 => MessageType::InsertLeaf,
            3 => MessageType::RemoveLeaf,
            4 => MessageType::TryAuth,
            5 => MessageType::ResetAuth,
            6 => MessageType::GetLog,
            7 => MessageType::LogReplay,
            _ => return Err(Error::TypeInvalid),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    /// raw type byte, may name an unknown type
    pub kind: u8,
    pub data_length: u16,
}

impl RequestHeader {
    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let len = self.data_length.to_le_bytes();
        [self.version, self.kind, len[0], len[1]]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            version: r.u8()?,
            kind: r.u8()?,
            data_length: r.u16()?,
        })
    }
}

/// payload of an insert_leaf request
pub struct InsertLeafRequest {
    pub label: u64,
    pub delay_schedule: DelaySchedule,
    pub sensitive: LeafSensitiveData,
    pub valid_pcr_criteria: PcrCriteria,
    pub path_hashes: Vec<Hash>,
}

/// a decoded request
pub enum Request {
    ResetTree {
        bits_per_level: u8,
        height: u8,
    },
    InsertLeaf(InsertLeafRequest),
    RemoveLeaf {
        label: u64,
        leaf_hmac: Hash,
        path_hashes: Vec<Hash>,
    },
    TryAuth {
        low_entropy_secret: Zeroizing<[u8; SECRET_SIZE]>,
        leaf: WrappedLeaf,
        path_hashes: Vec<Hash>,
    },
    ResetAuth {
        reset_secret: Zeroizing<[u8; SECRET_SIZE]>,
        leaf: WrappedLeaf,
        path_hashes: Vec<Hash>,
    },
    GetLog {
        root: Hash,
    },
    LogReplay {
        log_root: Hash,
        leaf: WrappedLeaf,
        path_hashes: Vec<Hash>,
    },
}

/// read a wrapped leaf and the path hashes that must exactly fill the rest
fn read_leaf_and_path(
    r: &mut Reader<'_>,
    aux_hash_count: usize,
) -> Result<(WrappedLeaf, Vec<Hash>)> {
    if r.remaining() < WRAPPED_LEAF_PREFIX {
        return Err(Error::LengthInvalid);
    }
    let header = LeafHeader::read(r)?;
    let payload_len = r.remaining() - (WRAPPED_LEAF_PREFIX - crate::leaf::LEAF_HEADER_SIZE);
    validate_leaf_header(&header, payload_len, aux_hash_count)?;

    let leaf = WrappedLeaf::read(r, header)?;
    let path_hashes = r.hashes(aux_hash_count)?;
    Ok((leaf, path_hashes))
}

fn write_hashes(hashes: &[Hash], out: &mut Vec<u8>) {
    for h in hashes {
        out.extend_from_slice(h);
    }
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::ResetTree { .. } => MessageType::ResetTree,
            Request::InsertLeaf(_) => MessageType::InsertLeaf,
            Request::RemoveLeaf { .. } => MessageType::RemoveLeaf,
            Request::TryAuth { .. } => MessageType::TryAuth,
            Request::ResetAuth { .. } => MessageType::ResetAuth,
            Request::GetLog { .. } => MessageType::GetLog,
            Request::LogReplay { .. } => MessageType::LogReplay,
        }
    }

    /// decode a payload of a supported protocol `version`
    ///
    /// `aux_hash_count` is the path length of the loaded tree. any payload
    /// that does not exactly fit is rejected as length invalid.
    pub fn decode(
        version: u8,
        kind: MessageType,
        payload: &[u8],
        aux_hash_count: usize,
    ) -> Result<Self> {
        let mut r = Reader::new(payload);
        let request = match kind {
            MessageType::ResetTree => Request::ResetTree {
                bits_per_level: r.u8()?,
                height: r.u8()?,
            },
            MessageType::InsertLeaf => {
                let pcr_len = if version == 0 { 0 } else { PCR_CRITERIA_SIZE };
                let expected = 8
                    + DELAY_SCHEDULE_SIZE
                    + SENSITIVE_DATA_SIZE
                    + pcr_len
                    + aux_hash_count * HASH_SIZE;
                if payload.len() != expected {
                    return Err(Error::LengthInvalid);
                }

                let label = r.u64()?;
                let delay_schedule = read_schedule(&mut r)?;
                let sensitive = LeafSensitiveData::new(r.array()?, r.array()?, r.array()?);
                // protocol 0 predates pcr binding
                let valid_pcr_criteria = if version == 0 {
                    [ValidPcrValue::default(); MAX_PCR_CRITERIA_COUNT]
                } else {
                    read_pcr_criteria(&mut r)?
                };
                Request::InsertLeaf(InsertLeafRequest {
                    label,
                    delay_schedule,
                    sensitive,
                    valid_pcr_criteria,
                    path_hashes: r.hashes(aux_hash_count)?,
                })
            }
            MessageType::RemoveLeaf => Request::RemoveLeaf {
                label: r.u64()?,
                leaf_hmac: r.array()?,
                path_hashes: r.hashes(aux_hash_count)?,
            },
            MessageType::TryAuth => {
                let low_entropy_secret = Zeroizing::new(r.array()?);
                let (leaf, path_hashes) = read_leaf_and_path(&mut r, aux_hash_count)?;
                Request::TryAuth {
                    low_entropy_secret,
                    leaf,
                    path_hashes,
                }
            }
            MessageType::ResetAuth => {
                let reset_secret = Zeroizing::new(r.array()?);
                let (leaf, path_hashes) = read_leaf_and_path(&mut r, aux_hash_count)?;
                Request::ResetAuth {
                    reset_secret,
                    leaf,
                    path_hashes,
                }
            }
            MessageType::GetLog => Request::GetLog { root: r.array()? },
            MessageType::LogReplay => {
                let log_root = r.array()?;
                let (leaf, path_hashes) = read_leaf_and_path(&mut r, aux_hash_count)?;
                Request::LogReplay {
                    log_root,
                    leaf,
                    path_hashes,
                }
            }
            MessageType::Invalid => return Err(Error::TypeInvalid),
        };
        r.finish()?;
        Ok(request)
    }

    /// payload bytes in the layout of protocol `version`
    pub fn payload(&self, version: u8) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Request::ResetTree {
                bits_per_level,
                height,
            } => {
                out.push(*bits_per_level);
                out.push(*height);
            }
            Request::InsertLeaf(req) => {
                out.extend_from_slice(&req.label.to_le_bytes());
                write_schedule(&req.delay_schedule, &mut out);
                out.extend_from_slice(req.sensitive.to_bytes().as_slice());
                if version != 0 {
                    write_pcr_criteria(&req.valid_pcr_criteria, &mut out);
                }
                write_hashes(&req.path_hashes, &mut out);
            }
            Request::RemoveLeaf {
                label,
                leaf_hmac,
                path_hashes,
            } => {
                out.extend_from_slice(&label.to_le_bytes());
                out.extend_from_slice(leaf_hmac);
                write_hashes(path_hashes, &mut out);
            }
            Request::TryAuth {
                low_entropy_secret: secret,
                leaf,
                path_hashes,
            }
            | Request::ResetAuth {
                reset_secret: secret,
                leaf,
                path_hashes,
            } => {
                out.extend_from_slice(secret.as_slice());
                out.extend_from_slice(&leaf.to_bytes());
                write_hashes(path_hashes, &mut out);
            }
            Request::GetLog { root } => out.extend_from_slice(root),
            Request::LogReplay {
                log_root,
                leaf,
                path_hashes,
            } => {
                out.extend_from_slice(log_root);
                out.extend_from_slice(&leaf.to_bytes());
                write_hashes(path_hashes, &mut out);
            }
        }
        out
    }

    /// header and payload, ready to hand to the engine
    pub fn to_bytes(&self, version: u8) -> Result<Vec<u8>> {
        let payload = self.payload(version);
        let header = RequestHeader {
            version,
            kind: self.message_type() as u8,
            data_length: u16::try_from(payload.len()).map_err(|_| Error::LengthInvalid)?,
        };
        let mut out = Vec::with_capacity(REQUEST_HEADER_SIZE + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub data_length: u16,
    pub result_code: u32,
    /// engine root after handling the request
    pub root: Hash,
}

impl ResponseHeader {
    pub fn to_bytes(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut out = [0u8; RESPONSE_HEADER_SIZE];
        out[0] = self.version;
        out[1..3].copy_from_slice(&self.data_length.to_le_bytes());
        out[3..7].copy_from_slice(&self.result_code.to_le_bytes());
        out[7..].copy_from_slice(&self.root);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            version: r.u8()?,
            data_length: r.u16()?,
            result_code: r.u32()?,
            root: r.array()?,
        })
    }
}

/// typed response payloads
pub enum ResponseData {
    None,
    InsertLeaf {
        leaf: WrappedLeaf,
    },
    /// secrets are zero unless the attempt succeeded; `leaf` is absent when
    /// the attempt was rate limited
    TryAuth {
        seconds_to_wait: u32,
        high_entropy_secret: Zeroizing<[u8; SECRET_SIZE]>,
        reset_secret: Zeroizing<[u8; SECRET_SIZE]>,
        leaf: Option<WrappedLeaf>,
    },
    ResetAuth {
        high_entropy_secret: Zeroizing<[u8; SECRET_SIZE]>,
        leaf: WrappedLeaf,
    },
    GetLog {
        entries: Vec<LogEntry>,
    },
    LogReplay {
        leaf: WrappedLeaf,
    },
}

impl ResponseData {
    /// try_auth response for a rate limited attempt
    pub fn rate_limited(seconds_to_wait: u32) -> Self {
        ResponseData::TryAuth {
            seconds_to_wait,
            high_entropy_secret: Zeroizing::new([0u8; SECRET_SIZE]),
            reset_secret: Zeroizing::new([0u8; SECRET_SIZE]),
            leaf: None,
        }
    }

    /// the wrapped leaf carried by this response, if any
    pub fn leaf(&self) -> Option<&WrappedLeaf> {
        match self {
            ResponseData::InsertLeaf { leaf }
            | ResponseData::ResetAuth { leaf, .. }
            | ResponseData::LogReplay { leaf } => Some(leaf),
            ResponseData::TryAuth { leaf, .. } => leaf.as_ref(),
            ResponseData::None | ResponseData::GetLog { .. } => None,
        }
    }

    /// payload bytes in the layout of protocol `version`
    pub fn to_bytes(&self, version: u8) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ResponseData::None => {}
            ResponseData::InsertLeaf { leaf } | ResponseData::LogReplay { leaf } => {
                out.extend_from_slice(&leaf.to_bytes());
            }
            ResponseData::TryAuth {
                seconds_to_wait,
                high_entropy_secret,
                reset_secret,
                leaf,
            } => {
                out.extend_from_slice(&seconds_to_wait.to_le_bytes());
                out.extend_from_slice(high_entropy_secret.as_slice());
                if version != 0 {
                    out.extend_from_slice(reset_secret.as_slice());
                }
                match leaf {
                    Some(leaf) => out.extend_from_slice(&leaf.to_bytes()),
                    None => out.resize(out.len() + WRAPPED_LEAF_SIZE, 0),
                }
            }
            ResponseData::ResetAuth {
                high_entropy_secret,
                leaf,
            } => {
                out.extend_from_slice(high_entropy_secret.as_slice());
                out.extend_from_slice(&leaf.to_bytes());
            }
            ResponseData::GetLog { entries } => {
                for entry in entries {
                    entry.write(&mut out);
                }
            }
        }
        out
    }

    /// decode the payload of a response to a request of type `kind`
    pub fn decode(version: u8, kind: MessageType, payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(ResponseData::None);
        }

        let mut r = Reader::new(payload);
        let data = match kind {
            MessageType::InsertLeaf => ResponseData::InsertLeaf {
                leaf: WrappedLeaf::from_bytes(r.take(payload.len())?)?,
            },
            MessageType::TryAuth => {
                let seconds_to_wait = r.u32()?;
                let high_entropy_secret = Zeroizing::new(r.array()?);
                let reset_secret = if version == 0 {
                    Zeroizing::new([0u8; SECRET_SIZE])
                } else {
                    Zeroizing::new(r.array()?)
                };
                let rest = r.take(r.remaining())?;
                // a zero filled leaf area means no leaf was returned
                let leaf = if rest.iter().all(|&b| b == 0) {
                    None
                } else {
                    Some(WrappedLeaf::from_bytes(rest)?)
                };
                ResponseData::TryAuth {
                    seconds_to_wait,
                    high_entropy_secret,
                    reset_secret,
                    leaf,
                }
            }
            MessageType::ResetAuth => {
                let high_entropy_secret = Zeroizing::new(r.array()?);
                let rest = r.take(r.remaining())?;
                ResponseData::ResetAuth {
                    high_entropy_secret,
                    leaf: WrappedLeaf::from_bytes(rest)?,
                }
            }
            MessageType::GetLog => {
                if payload.len() % LOG_ENTRY_SIZE != 0 {
                    return Err(Error::LengthInvalid);
                }
                let entries = (0..payload.len() / LOG_ENTRY_SIZE)
                    .map(|_| LogEntry::read(&mut r))
                    .collect::<Result<Vec<_>>>()?;
                ResponseData::GetLog { entries }
            }
            MessageType::LogReplay => ResponseData::LogReplay {
                leaf: WrappedLeaf::from_bytes(r.take(payload.len())?)?,
            },
            MessageType::Invalid | MessageType::ResetTree | MessageType::RemoveLeaf => {
                return Err(Error::LengthInvalid)
            }
        };
        r.finish()?;
        Ok(data)
    }
}

/// a complete response
pub struct Response {
    pub header: ResponseHeader,
    pub data: ResponseData,
}

impl Response {
    /// frame a response for a caller speaking `version`
    ///
    /// versions newer than ours are answered in the current version.
    pub fn new(version: u8, result_code: u32, root: Hash, data: ResponseData) -> Self {
        let version = version.min(PROTOCOL_VERSION);
        let data_length = data.to_bytes(version).len() as u16;
        Self {
            header: ResponseHeader {
                version,
                data_length,
                result_code,
                root,
            },
            data,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.data.to_bytes(self.header.version);
        let mut out = Vec::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// parse a response to a request of type `kind`
    pub fn from_bytes(bytes: &[u8], kind: MessageType) -> Result<Self> {
        let header = ResponseHeader::from_bytes(bytes)?;
        if bytes.len() != RESPONSE_HEADER_SIZE + header.data_length as usize {
            return Err(Error::LengthInvalid);
        }
        let data = ResponseData::decode(header.version, kind, &bytes[RESPONSE_HEADER_SIZE..])?;
        Ok(Self { header, data })
    }

    /// the result as a typed error
    pub fn result(&self) -> Result<()> {
        if self.header.result_code == crate::error::SUCCESS {
            return Ok(());
        }
        let seconds_to_wait = match &self.data {
            ResponseData::TryAuth {
                seconds_to_wait, ..
            } => *seconds_to_wait,
            _ => 0,
        };
        let code = self.header.result_code;
        Err(Error::from_code(code, seconds_to_wait)
            .unwrap_or_else(|| Error::Storage(format!("unknown result code {:#x}", code))))
    }
}
