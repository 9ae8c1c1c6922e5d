//! The chunk manager contract: a durable ordering primitive mapping each
//! record to a `(chunk, position)` pair, with at most one active chunk.
//!
//! All state mutations are serialized under one manager mutex. Cursors
//! never hold that mutex; they operate on a snapshot taken at open time or
//! on the immutable prefix of the append-only storage.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk_meta::{ChunkId, ChunkMeta};
use crate::error::{Error, Result};
use crate::record::{Record, RecordRef};

/// Iterates the records of one chunk. Dropping a cursor releases its
/// resources.
pub trait Cursor: Send {
    /// Next record in append order; `Error::NoMoreRecords` past the end.
    fn next(&mut self) -> Result<(Record, RecordRef)>;

    /// Previous record; `Error::NoMoreRecords` before the start.
    fn prev(&mut self) -> Result<(Record, RecordRef)>;

    /// Positions the cursor so the following `next` returns the record at
    /// `to`.
    fn seek(&mut self, to: &RecordRef) -> Result<()>;
}

pub trait ChunkManager: Send + Sync {
    /// Appends `record`, rotating the active chunk first when the rotation
    /// policy fires. Assigns `write_ts` and persists the updated metadata
    /// before the append becomes visible.
    fn append(&self, record: Record) -> Result<RecordRef>;

    /// Like `append`, but keeps the caller supplied `write_ts` (replay and
    /// backfill). Fails with `MissingWriteTs` when it is zero.
    fn append_preserved(&self, record: Record) -> Result<RecordRef>;

    /// Seals the active chunk; no-op when none is active.
    fn seal(&self) -> Result<()>;

    /// Metadata snapshot of the active chunk.
    fn active(&self) -> Option<ChunkMeta>;

    fn meta(&self, id: &ChunkId) -> Result<ChunkMeta>;

    /// Metadata snapshot of all chunks, oldest first.
    fn list(&self) -> Result<Vec<ChunkMeta>>;

    /// Opens a cursor over a chunk, active or sealed.
    fn open_cursor(&self, id: &ChunkId) -> Result<Box<dyn Cursor>>;

    /// Removes a sealed chunk with its storage; fails with `ActiveChunk`
    /// for the active one.
    fn delete(&self, id: &ChunkId) -> Result<()>;

    /// Position of the latest record with `write_ts <= ts`, or `None` when
    /// `ts` predates the chunk (or the chunk is empty).
    fn find_start_position(&self, id: &ChunkId, ts: i64) -> Result<Option<u64>>;

    /// Batch `write_ts` retrieval; any invalid position fails the call.
    fn read_write_timestamps(&self, id: &ChunkId, positions: &[u64]) -> Result<Vec<i64>>;
}

pub(crate) fn epoch_ns() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_nanos() as i64,
        Err(_) => 0,
    }
}

/// Assigns the record's `write_ts`: clock time clamped to the chunk's last
/// write timestamp, so the sequence stays non-decreasing even when the
/// clock steps backwards. Preserved appends keep the caller's value.
pub(crate) fn stamp_write_ts(record: &mut Record, preserved: bool, last_write_ts: i64) -> Result<()> {
    if preserved {
        if record.write_ts == 0 {
            return Err(Error::MissingWriteTs);
        }
    } else {
        record.write_ts = epoch_ns().max(last_write_ts);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::SourceId;

    #[test]
    fn test_stamp_clamps_to_last() {
        let far_future = i64::MAX - 1;
        let mut record = Record::new("x", SourceId::generate());
        stamp_write_ts(&mut record, false, far_future).unwrap();
        assert_eq!(record.write_ts, far_future);
    }

    #[test]
    fn test_preserved_requires_write_ts() {
        let mut record = Record::new("x", SourceId::generate());
        assert!(matches!(
            stamp_write_ts(&mut record, true, 0),
            Err(Error::MissingWriteTs)
        ));

        record.write_ts = 17;
        stamp_write_ts(&mut record, true, 0).unwrap();
        assert_eq!(record.write_ts, 17);
    }
}
