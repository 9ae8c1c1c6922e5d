//! Timestamp indexes: sparse seek structures mapping time to record
//! positions.
//!
//! Two on-disk artifacts per chunk (`_ingest.idx`, `_source.idx`) hold
//! `(ts, pos)` entries sorted by timestamp, ties by position; the source
//! artifact skips records without a source timestamp. The in-RAM sparse
//! write-ts index accelerates `find_start_position` on memory chunks.

use std::path::Path;

use proxmox_io::ReadExt;
use tokio_util::sync::CancellationToken;

use crate::chunk_manager::ChunkManager;
use crate::chunk_meta::ChunkId;
use crate::error::{Error, Result};
use crate::file_formats::{
    IndexHeader, TsidxEntry, INGEST_TSIDX_NAME, INGEST_TSIDX_TYPE, SOURCE_TSIDX_NAME,
    SOURCE_TSIDX_TYPE,
};
use crate::indexer::{check_position, check_sealed};
use crate::inverted_index::write_index_file;

fn encode_tsidx(index_type: u8, entries: &mut Vec<(i64, u32)>) -> Vec<u8> {
    entries.sort_unstable();

    let mut buf = Vec::with_capacity(8 + entries.len() * 12);
    buf.extend_from_slice(&IndexHeader::new(index_type).to_bytes());
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (ts, pos) in entries.iter() {
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&pos.to_le_bytes());
    }
    buf
}

/// Builds the ingest and source timestamp artifacts in one cursor pass.
pub fn build_timestamp_indexes(
    manager: &dyn ChunkManager,
    chunk_id: &ChunkId,
    chunk_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    check_sealed(manager, chunk_id)?;

    let mut ingest = Vec::new();
    let mut source = Vec::new();

    let mut cursor = manager.open_cursor(chunk_id)?;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (record, record_ref) = match cursor.next() {
            Ok(item) => item,
            Err(Error::NoMoreRecords) => break,
            Err(err) => return Err(err),
        };
        let pos = check_position(record_ref.pos)?;

        ingest.push((record.ingest_ts, pos));
        if record.source_ts != 0 {
            source.push((record.source_ts, pos));
        }
    }
    drop(cursor);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    write_index_file(
        &chunk_dir.join(INGEST_TSIDX_NAME),
        &encode_tsidx(INGEST_TSIDX_TYPE, &mut ingest),
    )?;
    write_index_file(
        &chunk_dir.join(SOURCE_TSIDX_NAME),
        &encode_tsidx(SOURCE_TSIDX_TYPE, &mut source),
    )?;

    log::debug!(
        "chunk {chunk_id}: timestamp indexes built ({} ingest, {} source entries)",
        ingest.len(),
        source.len()
    );

    Ok(())
}

/// Loaded timestamp artifact.
pub struct TsidxReader {
    entries: Vec<(i64, u32)>,
}

impl TsidxReader {
    pub fn open_ingest(chunk_dir: &Path) -> Result<Self> {
        Self::open(&chunk_dir.join(INGEST_TSIDX_NAME), INGEST_TSIDX_TYPE)
    }

    pub fn open_source(chunk_dir: &Path) -> Result<Self> {
        Self::open(&chunk_dir.join(SOURCE_TSIDX_NAME), SOURCE_TSIDX_TYPE)
    }

    fn open(path: &Path, index_type: u8) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::IndexNotFound(path.to_owned()));
            }
            Err(err) => return Err(err.into()),
        };

        if data.len() < 8 {
            return Err(Error::IndexTooSmall {
                size: data.len() as u64,
            });
        }

        let header = IndexHeader::from_bytes(data[0..4].try_into().unwrap());
        header.check(index_type)?;

        let entry_count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if data.len() - 8 != entry_count * 12 {
            return Err(Error::PostingSizeMismatch);
        }

        let mut reader = &data[8..];
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let entry: TsidxEntry = unsafe { reader.read_le_value()? };
            entries.push((entry.ts, entry.pos));
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First position with `ts >= target`; `(0, false)` when `target` is
    /// past every entry.
    pub fn find_start_position(&self, target: i64) -> (u32, bool) {
        let idx = self.entries.partition_point(|(ts, _)| *ts < target);
        match self.entries.get(idx) {
            Some((_, pos)) => (*pos, true),
            None => (0, false),
        }
    }
}

/// Sparse `(write_ts, position)` samples at a fixed stride, kept in RAM by
/// the memory chunk manager to narrow write-ts seeks.
pub struct SparseWriteTsIndex {
    stride: usize,
    observed: usize,
    entries: Vec<(i64, u32)>,
}

impl SparseWriteTsIndex {
    pub fn new(stride: usize) -> Self {
        Self {
            stride: stride.max(1),
            observed: 0,
            entries: Vec::new(),
        }
    }

    /// Called once per append, in order.
    pub fn observe(&mut self, write_ts: i64, pos: u32) {
        if self.observed % self.stride == 0 {
            self.entries.push((write_ts, pos));
        }
        self.observed += 1;
    }

    /// Latest sample with `ts <= target`.
    pub fn find_latest(&self, target: i64) -> Option<(i64, u32)> {
        let idx = self.entries.partition_point(|(ts, _)| *ts <= target);
        idx.checked_sub(1).map(|idx| self.entries[idx])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
