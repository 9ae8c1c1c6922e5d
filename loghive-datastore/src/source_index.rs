//! Source id index: `source_id -> [record positions]`, keyed by the raw
//! 16 byte id.
//!
//! Not to be confused with the source timestamp artifact; the two share
//! the "source" name but carry distinct header type codes.
//!
//! Every record has exactly one source id, so a single cursor pass can
//! push positions directly; the posting lists come out ascending without
//! any dedup.

use std::collections::BTreeMap;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::chunk_manager::ChunkManager;
use crate::chunk_meta::ChunkId;
use crate::error::{Error, Result};
use crate::file_formats::{SOURCE_ID_INDEX_NAME, SOURCE_ID_INDEX_TYPE};
use crate::indexer::{check_position, check_sealed};
use crate::inverted_index::{
    encode, write_index_file, IndexEntry, InvertedIndexReader, KeyEntry,
};
use crate::record::SourceId;

pub fn build_source_id_index(
    manager: &dyn ChunkManager,
    chunk_id: &ChunkId,
    chunk_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    check_sealed(manager, chunk_id)?;

    let mut sources: BTreeMap<[u8; 16], Vec<u32>> = BTreeMap::new();

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

        sources
            .entry(*record.source_id.as_bytes())
            .or_default()
            .push(pos);
    }
    drop(cursor);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let entry_count = sources.len();
    let entries: Vec<KeyEntry> = sources
        .into_iter()
        .map(|(id, positions)| KeyEntry::from_parts(id.to_vec(), None, positions))
        .collect();

    write_index_file(
        &chunk_dir.join(SOURCE_ID_INDEX_NAME),
        &encode(SOURCE_ID_INDEX_TYPE, None, entries),
    )?;

    log::debug!("chunk {chunk_id}: source id index built ({entry_count} sources)");

    Ok(())
}

/// Loaded source id artifact.
pub struct SourceIdIndexReader {
    inner: InvertedIndexReader<KeyEntry>,
}

impl SourceIdIndexReader {
    pub fn open(chunk_dir: &Path) -> Result<Self> {
        let inner = InvertedIndexReader::open(
            &chunk_dir.join(SOURCE_ID_INDEX_NAME),
            SOURCE_ID_INDEX_TYPE,
            false,
        )?;
        Ok(Self { inner })
    }

    pub fn lookup(&self, source_id: &SourceId) -> Option<&[u32]> {
        self.inner.lookup(source_id.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
