//! Budgeted kv indexes over pairs extracted from the raw payload.
//!
//! Shape and passes match the attribute indexes, with two extra stages:
//! defensive hard caps checked while counting (a runaway extractor yields
//! empty, capped artifacts instead of an unbounded index), and per-index
//! frequency-ordered admission against a byte budget.

use std::collections::BTreeMap;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use loghive_tools::kv_extract::KvExtractor;

use crate::attr_index::{CountSlot, FillSlot};
use crate::chunk_manager::ChunkManager;
use crate::chunk_meta::ChunkId;
use crate::error::{Error, Result};
use crate::file_formats::{
    IndexStatus, KV_KEY_INDEX_NAME, KV_KEY_INDEX_TYPE, KV_KV_INDEX_NAME, KV_KV_INDEX_TYPE,
    KV_VALUE_INDEX_NAME, KV_VALUE_INDEX_TYPE,
};
use crate::indexer::{check_position, check_sealed};
use crate::inverted_index::{
    admit_by_frequency, encode, key_entry_cost, kv_entry_cost, write_index_file,
    AdmissionCandidate, IndexEntry, InvertedIndexReader, KeyEntry, KvEntry,
};

#[derive(Clone, Debug)]
pub struct KvIndexConfig {
    /// Byte budget, applied to each of the three indexes independently.
    pub budget: usize,
    pub max_unique_keys: usize,
    pub max_values_per_key: usize,
    pub max_total_entries: usize,
}

impl Default for KvIndexConfig {
    fn default() -> Self {
        Self {
            budget: 4 * 1024 * 1024,
            max_unique_keys: 64 * 1024,
            max_values_per_key: 32 * 1024,
            max_total_entries: 256 * 1024,
        }
    }
}

fn write_capped_empty(chunk_dir: &Path) -> Result<()> {
    write_index_file(
        &chunk_dir.join(KV_KEY_INDEX_NAME),
        &encode::<KeyEntry>(KV_KEY_INDEX_TYPE, Some(IndexStatus::Capped), Vec::new()),
    )?;
    write_index_file(
        &chunk_dir.join(KV_VALUE_INDEX_NAME),
        &encode::<KeyEntry>(KV_VALUE_INDEX_TYPE, Some(IndexStatus::Capped), Vec::new()),
    )?;
    write_index_file(
        &chunk_dir.join(KV_KV_INDEX_NAME),
        &encode::<KvEntry>(KV_KV_INDEX_TYPE, Some(IndexStatus::Capped), Vec::new()),
    )?;
    Ok(())
}

/// Admits key shaped candidates; returns the surviving map and status.
fn admit_keys(
    counts: &BTreeMap<Vec<u8>, CountSlot>,
    budget: usize,
) -> (BTreeMap<Vec<u8>, FillSlot>, IndexStatus) {
    let items: Vec<(&Vec<u8>, &CountSlot)> = counts.iter().collect();

    let candidates = items
        .iter()
        .enumerate()
        .map(|(index, (key, slot))| AdmissionCandidate {
            index,
            count: slot.count as usize,
            cost: key_entry_cost(key.len(), slot.count as usize),
        })
        .collect();
    let (admitted, capped) = admit_by_frequency(candidates, budget);

    let mut lists = BTreeMap::new();
    for index in admitted {
        let (key, slot) = items[index];
        lists.insert(key.clone(), FillSlot::with_capacity(slot.count as usize));
    }

    let status = if capped {
        IndexStatus::Capped
    } else {
        IndexStatus::Complete
    };
    (lists, status)
}

fn admit_pairs(
    counts: &BTreeMap<(Vec<u8>, Vec<u8>), CountSlot>,
    budget: usize,
) -> (BTreeMap<(Vec<u8>, Vec<u8>), FillSlot>, IndexStatus) {
    let items: Vec<(&(Vec<u8>, Vec<u8>), &CountSlot)> = counts.iter().collect();

    let candidates = items
        .iter()
        .enumerate()
        .map(|(index, ((key, value), slot))| AdmissionCandidate {
            index,
            count: slot.count as usize,
            cost: kv_entry_cost(key.len(), value.len(), slot.count as usize),
        })
        .collect();
    let (admitted, capped) = admit_by_frequency(candidates, budget);

    let mut lists = BTreeMap::new();
    for index in admitted {
        let (pair, slot) = items[index];
        lists.insert(pair.clone(), FillSlot::with_capacity(slot.count as usize));
    }

    let status = if capped {
        IndexStatus::Capped
    } else {
        IndexStatus::Complete
    };
    (lists, status)
}

pub fn build_kv_indexes(
    manager: &dyn ChunkManager,
    chunk_id: &ChunkId,
    chunk_dir: &Path,
    extractor: &dyn KvExtractor,
    config: &KvIndexConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    check_sealed(manager, chunk_id)?;

    let mut keys: BTreeMap<Vec<u8>, CountSlot> = BTreeMap::new();
    let mut values: BTreeMap<Vec<u8>, CountSlot> = BTreeMap::new();
    let mut pairs: BTreeMap<(Vec<u8>, Vec<u8>), CountSlot> = BTreeMap::new();
    let mut values_per_key: BTreeMap<Vec<u8>, usize> = BTreeMap::new();

    // pass 1: count, watching the hard caps
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

        extractor.extract(&record.raw, &mut |key, value| {
            keys.entry(key.to_vec()).or_default().observe(pos);
            values.entry(value.to_vec()).or_default().observe(pos);
            let pair = (key.to_vec(), value.to_vec());
            if !pairs.contains_key(&pair) {
                *values_per_key.entry(pair.0.clone()).or_insert(0) += 1;
            }
            pairs.entry(pair).or_default().observe(pos);
        });

        let over_value_cap = values_per_key
            .values()
            .any(|&count| count > config.max_values_per_key);
        if keys.len() > config.max_unique_keys
            || pairs.len() > config.max_total_entries
            || over_value_cap
        {
            log::warn!("chunk {chunk_id}: kv extraction hit a hard cap, writing empty artifacts");
            return write_capped_empty(chunk_dir);
        }
    }
    drop(cursor);

    // per-index budgeted admission
    let (mut key_lists, key_status) = admit_keys(&keys, config.budget);
    let (mut value_lists, value_status) = admit_keys(&values, config.budget);
    let (mut pair_lists, pair_status) = admit_pairs(&pairs, config.budget);
    drop(keys);
    drop(values);
    drop(pairs);

    // pass 2: fill the admitted posting lists
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

        extractor.extract(&record.raw, &mut |key, value| {
            if let Some(slot) = key_lists.get_mut(key) {
                slot.push(pos);
            }
            if let Some(slot) = value_lists.get_mut(value) {
                slot.push(pos);
            }
            // dropped pairs miss this map and are skipped silently
            if let Some(slot) = pair_lists.get_mut(&(key.to_vec(), value.to_vec())) {
                slot.push(pos);
            }
        });
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

    write_index_file(
        &chunk_dir.join(KV_KEY_INDEX_NAME),
        &encode(KV_KEY_INDEX_TYPE, Some(key_status), key_entries),
    )?;
    write_index_file(
        &chunk_dir.join(KV_VALUE_INDEX_NAME),
        &encode(KV_VALUE_INDEX_TYPE, Some(value_status), value_entries),
    )?;
    write_index_file(
        &chunk_dir.join(KV_KV_INDEX_NAME),
        &encode(KV_KV_INDEX_TYPE, Some(pair_status), pair_entries),
    )?;

    log::debug!(
        "chunk {chunk_id}: kv indexes built (key {key_status:?}, value {value_status:?}, kv {pair_status:?})"
    );

    Ok(())
}

/// The three loaded kv artifacts of one chunk.
pub struct KvIndexReader {
    keys: InvertedIndexReader<KeyEntry>,
    values: InvertedIndexReader<KeyEntry>,
    pairs: InvertedIndexReader<KvEntry>,
}

impl KvIndexReader {
    pub fn open(chunk_dir: &Path) -> Result<Self> {
        Ok(Self {
            keys: InvertedIndexReader::open(
                &chunk_dir.join(KV_KEY_INDEX_NAME),
                KV_KEY_INDEX_TYPE,
                true,
            )?,
            values: InvertedIndexReader::open(
                &chunk_dir.join(KV_VALUE_INDEX_NAME),
                KV_VALUE_INDEX_TYPE,
                true,
            )?,
            pairs: InvertedIndexReader::open(
                &chunk_dir.join(KV_KV_INDEX_NAME),
                KV_KV_INDEX_TYPE,
                true,
            )?,
        })
    }

    /// True when any of the three indexes dropped entries.
    pub fn is_capped(&self) -> bool {
        self.keys.is_capped() || self.values.is_capped() || self.pairs.is_capped()
    }

    pub fn key_entry_count(&self) -> usize {
        self.keys.len()
    }

    pub fn kv_entry_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn key_entries(&self) -> &[KeyEntry] {
        self.keys.entries()
    }

    pub fn pair_entries(&self) -> &[KvEntry] {
        self.pairs.entries()
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
