//! Attribute indexes: three artifacts per chunk over the receiver
//! supplied attributes, keyed by lowercased key, value and (key, value).
//!
//! Same two-pass scheme as the token index, but the posting lists are
//! small enough to fill exact-capacity arrays in memory and publish each
//! artifact in one atomic write.

use std::collections::BTreeMap;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::chunk_manager::ChunkManager;
use crate::chunk_meta::ChunkId;
use crate::error::{Error, Result};
use crate::file_formats::{
    ATTR_KEY_INDEX_NAME, ATTR_KEY_INDEX_TYPE, ATTR_KV_INDEX_NAME, ATTR_KV_INDEX_TYPE,
    ATTR_VALUE_INDEX_NAME, ATTR_VALUE_INDEX_TYPE,
};
use crate::indexer::{check_position, check_sealed};
use crate::inverted_index::{
    encode, write_index_file, IndexEntry, InvertedIndexReader, KeyEntry, KvEntry,
};

/// Pass-1 accumulator: occurrence count with record-local dedup.
#[derive(Default)]
pub(crate) struct CountSlot {
    pub count: u32,
    pub seen_pos: u32,
    pub counted: bool,
}

impl CountSlot {
    pub fn observe(&mut self, pos: u32) {
        if !self.counted || self.seen_pos != pos {
            self.count += 1;
            self.seen_pos = pos;
            self.counted = true;
        }
    }
}

/// Pass-2 accumulator: exact-capacity posting list with record-local
/// dedup.
pub(crate) struct FillSlot {
    pub positions: Vec<u32>,
}

impl FillSlot {
    pub fn with_capacity(count: usize) -> Self {
        Self {
            positions: Vec::with_capacity(count),
        }
    }

    pub fn push(&mut self, pos: u32) {
        if self.positions.last() != Some(&pos) {
            self.positions.push(pos);
        }
    }
}

fn lowercase(s: &str) -> Vec<u8> {
    s.bytes().map(|b| b.to_ascii_lowercase()).collect()
}

pub fn build_attr_indexes(
    manager: &dyn ChunkManager,
    chunk_id: &ChunkId,
    chunk_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    check_sealed(manager, chunk_id)?;

    let mut keys: BTreeMap<Vec<u8>, CountSlot> = BTreeMap::new();
    let mut values: BTreeMap<Vec<u8>, CountSlot> = BTreeMap::new();
    let mut pairs: BTreeMap<(Vec<u8>, Vec<u8>), CountSlot> = BTreeMap::new();

    // pass 1: count occurrences, one per containing record
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

        for (key, value) in &record.attrs {
            let key = lowercase(key);
            let value = lowercase(value);

            keys.entry(key.clone()).or_default().observe(pos);
            values.entry(value.clone()).or_default().observe(pos);
            pairs.entry((key, value)).or_default().observe(pos);
        }
    }
    drop(cursor);

    let mut key_lists: BTreeMap<Vec<u8>, FillSlot> = keys
        .iter()
        .map(|(key, slot)| (key.clone(), FillSlot::with_capacity(slot.count as usize)))
        .collect();
    let mut value_lists: BTreeMap<Vec<u8>, FillSlot> = values
        .iter()
        .map(|(value, slot)| (value.clone(), FillSlot::with_capacity(slot.count as usize)))
        .collect();
    let mut pair_lists: BTreeMap<(Vec<u8>, Vec<u8>), FillSlot> = pairs
        .iter()
        .map(|(pair, slot)| (pair.clone(), FillSlot::with_capacity(slot.count as usize)))
        .collect();

    // pass 2: fill the posting lists
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

        for (key, value) in &record.attrs {
            let key = lowercase(key);
            let value = lowercase(value);

            if let Some(slot) = key_lists.get_mut(&key) {
                slot.push(pos);
            }
            if let Some(slot) = value_lists.get_mut(&value) {
                slot.push(pos);
            }
            if let Some(slot) = pair_lists.get_mut(&(key, value)) {
                slot.push(pos);
            }
        }
    }
    drop(cursor);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let key_entries: Vec<KeyEntry> = key_lists
        .into_iter()
        .map(|(key, slot)| KeyEntry::from_parts(key, None, slot.positions))
        .collect();
    let value_entries: Vec<KeyEntry> = value_lists
        .into_iter()
        .map(|(value, slot)| KeyEntry::from_parts(value, None, slot.positions))
        .collect();
    let pair_entries: Vec<KvEntry> = pair_lists
        .into_iter()
        .map(|((key, value), slot)| KvEntry::from_parts(key, Some(value), slot.positions))
        .collect();

    let entry_counts = (key_entries.len(), value_entries.len(), pair_entries.len());

    write_index_file(
        &chunk_dir.join(ATTR_KEY_INDEX_NAME),
        &encode(ATTR_KEY_INDEX_TYPE, None, key_entries),
    )?;
    write_index_file(
        &chunk_dir.join(ATTR_VALUE_INDEX_NAME),
        &encode(ATTR_VALUE_INDEX_TYPE, None, value_entries),
    )?;
    write_index_file(
        &chunk_dir.join(ATTR_KV_INDEX_NAME),
        &encode(ATTR_KV_INDEX_TYPE, None, pair_entries),
    )?;

    log::debug!(
        "chunk {chunk_id}: attr indexes built ({} keys, {} values, {} pairs)",
        entry_counts.0,
        entry_counts.1,
        entry_counts.2
    );

    Ok(())
}

/// The three loaded attribute artifacts of one chunk.
pub struct AttrIndexReader {
    keys: InvertedIndexReader<KeyEntry>,
    values: InvertedIndexReader<KeyEntry>,
    pairs: InvertedIndexReader<KvEntry>,
}

impl AttrIndexReader {
    pub fn open(chunk_dir: &Path) -> Result<Self> {
        Ok(Self {
            keys: InvertedIndexReader::open(
                &chunk_dir.join(ATTR_KEY_INDEX_NAME),
                ATTR_KEY_INDEX_TYPE,
                false,
            )?,
            values: InvertedIndexReader::open(
                &chunk_dir.join(ATTR_VALUE_INDEX_NAME),
                ATTR_VALUE_INDEX_TYPE,
                false,
            )?,
            pairs: InvertedIndexReader::open(
                &chunk_dir.join(ATTR_KV_INDEX_NAME),
                ATTR_KV_INDEX_TYPE,
                false,
            )?,
        })
    }

    pub fn lookup_key(&self, key: &[u8]) -> Option<&[u32]> {
        self.keys.lookup(key)
    }

    pub fn lookup_value(&self, value: &[u8]) -> Option<&[u32]> {
        self.values.lookup(value)
    }

    pub fn kv_lookup(&self, key: &[u8], value: &[u8]) -> Option<&[u32]> {
        self.pairs.lookup_kv(key, value)
    }
}
