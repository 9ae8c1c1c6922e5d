use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use proxmox_uuid::Uuid;

use crate::chunk_meta::ChunkId;

/// Identifies the upstream source (receiver, host, socket) a record came
/// from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Uuid);

impl SourceId {
    pub fn generate() -> Self {
        Self(Uuid::generate())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SourceId {
    type Err = <Uuid as std::str::FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// One log record. Immutable once appended to a chunk.
///
/// All timestamps are nanoseconds since the epoch; `source_ts == 0` means
/// the original event time is unknown. `write_ts` is assigned by the chunk
/// manager on append and is non-decreasing within a chunk.
#[derive(Clone, Debug)]
pub struct Record {
    /// The original log line, byte for byte.
    pub raw: Vec<u8>,
    /// Receiver supplied attributes; keys are unique per record.
    pub attrs: HashMap<String, String>,
    pub ingest_ts: i64,
    pub write_ts: i64,
    pub source_ts: i64,
    pub source_id: SourceId,
}

impl Record {
    pub fn new(raw: impl Into<Vec<u8>>, source_id: SourceId) -> Self {
        Self {
            raw: raw.into(),
            attrs: HashMap::new(),
            ingest_ts: 0,
            write_ts: 0,
            source_ts: 0,
            source_id,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_ingest_ts(mut self, ts: i64) -> Self {
        self.ingest_ts = ts;
        self
    }

    pub fn with_source_ts(mut self, ts: i64) -> Self {
        self.source_ts = ts;
        self
    }

    /// Payload bytes accounted against a chunk's byte budget.
    pub fn payload_len(&self) -> usize {
        self.raw.len()
    }
}

/// Addresses one record inside one chunk.
///
/// The domain of `pos` depends on the chunk implementation: record index
/// for memory chunks, frame byte offset for on-disk chunks. Refs are only
/// ordered within a single chunk.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub chunk_id: ChunkId,
    pub pos: u64,
}

impl RecordRef {
    pub fn new(chunk_id: ChunkId, pos: u64) -> Self {
        Self { chunk_id, pos }
    }
}

impl PartialOrd for RecordRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        (self.chunk_id == other.chunk_id).then(|| self.pos.cmp(&other.pos))
    }
}
