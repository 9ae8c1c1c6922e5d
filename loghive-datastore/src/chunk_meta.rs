use std::fmt;

use serde::{Deserialize, Serialize};

use proxmox_uuid::Uuid;

use crate::record::Record;

/// Identifies one chunk. The canonical lowercase string form doubles as
/// the chunk directory name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(Uuid);

impl ChunkId {
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

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ChunkId {
    type Err = <Uuid as std::str::FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Per chunk bookkeeping, updated on every append and frozen by `seal`.
///
/// Timestamp bounds are nanoseconds since the epoch, zero while the chunk
/// is empty (and, for the source bounds, when no record carried a source
/// timestamp). `created` is wall clock epoch seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkMeta {
    pub id: ChunkId,
    pub sealed: bool,
    pub start_ts: i64,
    pub end_ts: i64,
    pub ingest_start: i64,
    pub ingest_end: i64,
    pub source_start: i64,
    pub source_end: i64,
    pub record_count: u64,
    pub byte_count: u64,
    pub created: i64,
}

impl ChunkMeta {
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            sealed: false,
            start_ts: 0,
            end_ts: 0,
            ingest_start: 0,
            ingest_end: 0,
            source_start: 0,
            source_end: 0,
            record_count: 0,
            byte_count: 0,
            created: proxmox_time::epoch_i64(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Accounts `record` (which already carries its final `write_ts`).
    pub(crate) fn update_bounds(&mut self, record: &Record) {
        if self.record_count == 0 {
            self.start_ts = record.write_ts;
            self.ingest_start = record.ingest_ts;
            self.ingest_end = record.ingest_ts;
        } else {
            if record.ingest_ts < self.ingest_start {
                self.ingest_start = record.ingest_ts;
            }
            if record.ingest_ts > self.ingest_end {
                self.ingest_end = record.ingest_ts;
            }
        }
        self.end_ts = record.write_ts;

        if record.source_ts != 0 {
            if self.source_start == 0 || record.source_ts < self.source_start {
                self.source_start = record.source_ts;
            }
            if record.source_ts > self.source_end {
                self.source_end = record.source_ts;
            }
        }

        self.record_count += 1;
        self.byte_count += record.payload_len() as u64;
    }
}

/// Snapshot of the active chunk handed to rotation policies.
#[derive(Clone, Debug)]
pub struct ActiveChunkState {
    pub id: ChunkId,
    pub last_write_ts: i64,
    pub created: i64,
    pub record_count: u64,
    pub byte_count: u64,
}

impl From<&ChunkMeta> for ActiveChunkState {
    fn from(meta: &ChunkMeta) -> Self {
        Self {
            id: meta.id.clone(),
            last_write_ts: meta.end_ts,
            created: meta.created,
            record_count: meta.record_count,
            byte_count: meta.byte_count,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::SourceId;

    #[test]
    fn test_bounds_tracking() {
        let mut meta = ChunkMeta::new(ChunkId::generate());
        let source_id = SourceId::generate();

        let mut first = Record::new("one", source_id.clone())
            .with_ingest_ts(50)
            .with_source_ts(7);
        first.write_ts = 100;
        meta.update_bounds(&first);

        let mut second = Record::new("two", source_id).with_ingest_ts(40);
        second.write_ts = 200;
        meta.update_bounds(&second);

        assert_eq!((meta.start_ts, meta.end_ts), (100, 200));
        assert_eq!((meta.ingest_start, meta.ingest_end), (40, 50));
        // zero source_ts must not widen the source bounds
        assert_eq!((meta.source_start, meta.source_end), (7, 7));
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.byte_count, 6);
    }

    #[test]
    fn test_meta_json_roundtrip() {
        let meta = ChunkMeta::new(ChunkId::generate());
        let data = serde_json::to_vec(&meta).unwrap();
        let parsed: ChunkMeta = serde_json::from_slice(&data).unwrap();
        assert_eq!(parsed.id, meta.id);
        assert_eq!(parsed.created, meta.created);
    }
}
