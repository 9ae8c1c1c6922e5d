//! Combined JSON path / path-value index: one artifact per chunk, two
//! posting tables sharing a single string dictionary.
//!
//! Layout:
//!
//! ```text
//! [header][status:u8]
//! [offset table, 7 x u32: dict_offset, dict_count, path_offset,
//!  path_count, pv_offset, pv_count, blob_offset]
//! [string dictionary: (len:u16, bytes)*]
//! [path table:       (dict_id:u32, blob_offset:u32, count:u32)*]
//! [path-value table: (path_id:u32, value_id:u32, blob_offset:u32, count:u32)*]
//! [posting blob:     u32 positions]
//! ```
//!
//! Section offsets are absolute; per-entry blob offsets are relative to
//! the blob start. Dictionary ids are assigned in lexicographic order, so
//! table order by id equals lexicographic order by string and every lookup
//! is a binary search. Paths are always admitted; (path, value) pairs run
//! through budgeted admission, with the dictionary and path table counting
//! as fixed overhead.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tokio_util::sync::CancellationToken;

use loghive_tools::json_walk::{walk_json, PATH_SEPARATOR};

use crate::attr_index::CountSlot;
use crate::chunk_manager::ChunkManager;
use crate::chunk_meta::ChunkId;
use crate::error::{Error, Result};
use crate::file_formats::{IndexHeader, IndexStatus, JSON_INDEX_NAME, JSON_INDEX_TYPE};
use crate::indexer::{check_position, check_sealed};
use crate::inverted_index::{admit_by_frequency, write_index_file, AdmissionCandidate};
use crate::posting_file::PostingFileWriter;

#[derive(Clone, Debug)]
pub struct JsonIndexConfig {
    /// Byte budget for the path-value table and its postings.
    pub budget: usize,
    pub max_unique_paths: usize,
    pub max_total_pv_pairs: usize,
}

impl Default for JsonIndexConfig {
    fn default() -> Self {
        Self {
            budget: 8 * 1024 * 1024,
            max_unique_paths: 64 * 1024,
            max_total_pv_pairs: 256 * 1024,
        }
    }
}

const FIXED_PREFIX: usize = 4 + 1 + 28;
const PATH_ENTRY_SIZE: usize = 12;
const PV_ENTRY_SIZE: usize = 16;

/// Encoded cost of one (path, value) pair: its table entry plus postings.
fn pv_cost(count: usize) -> usize {
    PV_ENTRY_SIZE + count * 4
}

#[derive(Default)]
struct Interner {
    map: HashMap<Vec<u8>, u32>,
    strings: Vec<Vec<u8>>,
}

impl Interner {
    fn intern(&mut self, s: &[u8]) -> u32 {
        if let Some(&id) = self.map.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.map.insert(s.to_vec(), id);
        self.strings.push(s.to_vec());
        id
    }

    fn get(&self, s: &[u8]) -> Option<u32> {
        self.map.get(s).copied()
    }

    fn resolve(&self, id: u32) -> &[u8] {
        &self.strings[id as usize]
    }
}

struct WriteSlot {
    abs_offset: usize,
    written: u32,
    seen_pos: u32,
}

impl WriteSlot {
    fn new(abs_offset: usize) -> Self {
        Self {
            abs_offset,
            written: 0,
            seen_pos: 0,
        }
    }

    fn write(&mut self, writer: &mut PostingFileWriter, pos: u32) -> Result<()> {
        if self.written > 0 && self.seen_pos == pos {
            return Ok(());
        }
        writer.write_u32_at(self.abs_offset + self.written as usize * 4, pos)?;
        self.written += 1;
        self.seen_pos = pos;
        Ok(())
    }
}

fn write_capped_empty(path: &Path) -> Result<()> {
    let mut buf = Vec::with_capacity(FIXED_PREFIX);
    buf.extend_from_slice(&IndexHeader::new(JSON_INDEX_TYPE).to_bytes());
    buf.push(IndexStatus::Capped.to_byte());
    let empty = FIXED_PREFIX as u32;
    for value in [empty, 0, empty, 0, empty, 0, empty] {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    write_index_file(path, &buf)
}

pub fn build_json_index(
    manager: &dyn ChunkManager,
    chunk_id: &ChunkId,
    chunk_dir: &Path,
    config: &JsonIndexConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    check_sealed(manager, chunk_id)?;

    let artifact = chunk_dir.join(JSON_INDEX_NAME);

    let mut interner = Interner::default();
    let mut path_counts: HashMap<u32, CountSlot> = HashMap::new();
    let mut pv_counts: HashMap<(u32, u32), CountSlot> = HashMap::new();

    // per-record walk output, buffers reused across records
    let mut walked_paths: Vec<Vec<u8>> = Vec::new();
    let mut walked_pvs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

    // pass 1: intern paths and values, count with record-local dedup
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

        walked_paths.clear();
        walked_pvs.clear();
        walk_json(
            &record.raw,
            &mut |path| walked_paths.push(path.to_vec()),
            &mut |path, value| walked_pvs.push((path.to_vec(), value.to_vec())),
        );

        for path in &walked_paths {
            let id = interner.intern(path);
            path_counts.entry(id).or_default().observe(pos);
        }
        for (path, value) in &walked_pvs {
            let path_id = interner.intern(path);
            let value_id = interner.intern(value);
            pv_counts
                .entry((path_id, value_id))
                .or_default()
                .observe(pos);
        }

        if path_counts.len() > config.max_unique_paths
            || pv_counts.len() > config.max_total_pv_pairs
        {
            log::warn!("chunk {chunk_id}: json walk hit a hard cap, writing an empty artifact");
            return write_capped_empty(&artifact);
        }
    }
    drop(cursor);

    // pv admission; candidates in (path, value) string order so ties
    // resolve identically across builds
    let mut pv_items: Vec<((u32, u32), u32)> = pv_counts
        .iter()
        .map(|(&ids, slot)| (ids, slot.count))
        .collect();
    pv_items.sort_by(|a, b| {
        (interner.resolve(a.0 .0), interner.resolve(a.0 .1))
            .cmp(&(interner.resolve(b.0 .0), interner.resolve(b.0 .1)))
    });

    let candidates = pv_items
        .iter()
        .enumerate()
        .map(|(index, (_, count))| AdmissionCandidate {
            index,
            count: *count as usize,
            cost: pv_cost(*count as usize),
        })
        .collect();
    let (admitted, capped) = admit_by_frequency(candidates, config.budget);
    let admitted: Vec<((u32, u32), u32)> = {
        let mut list: Vec<((u32, u32), u32)> =
            admitted.into_iter().map(|index| pv_items[index]).collect();
        list.sort_by_key(|(ids, _)| *ids);
        list
    };
    let status = if capped {
        IndexStatus::Capped
    } else {
        IndexStatus::Complete
    };

    // dictionary compaction: paths plus admitted values, renumbered in
    // lexicographic order
    let mut used: BTreeSet<Vec<u8>> = path_counts
        .keys()
        .map(|&id| interner.resolve(id).to_vec())
        .collect();
    for ((_, value_id), _) in &admitted {
        used.insert(interner.resolve(*value_id).to_vec());
    }

    let dict: Vec<Vec<u8>> = used.into_iter().collect();
    let final_ids: HashMap<&[u8], u32> = dict
        .iter()
        .enumerate()
        .map(|(idx, s)| (s.as_slice(), idx as u32))
        .collect();
    let remap = |provisional: u32| final_ids[interner.resolve(provisional)];

    let mut path_items: Vec<(u32, u32, u32)> = path_counts
        .iter()
        .map(|(&id, slot)| (remap(id), id, slot.count))
        .collect();
    path_items.sort_by_key(|&(final_id, _, _)| final_id);

    let mut pv_final: Vec<(u32, u32, (u32, u32), u32)> = admitted
        .iter()
        .map(|&((path_id, value_id), count)| {
            (remap(path_id), remap(value_id), (path_id, value_id), count)
        })
        .collect();
    pv_final.sort_by_key(|&(path, value, _, _)| (path, value));

    // layout
    let dict_size: usize = dict.iter().map(|s| 2 + s.len()).sum();
    let dict_offset = FIXED_PREFIX;
    let path_offset = dict_offset + dict_size;
    let pv_offset = path_offset + path_items.len() * PATH_ENTRY_SIZE;
    let blob_offset = pv_offset + pv_final.len() * PV_ENTRY_SIZE;

    let mut blob_size = 0usize;
    let mut path_slots: HashMap<u32, WriteSlot> = HashMap::with_capacity(path_items.len());
    let mut pv_slots: HashMap<(u32, u32), WriteSlot> = HashMap::with_capacity(pv_final.len());

    let mut prefix = Vec::with_capacity(blob_offset);
    prefix.extend_from_slice(&IndexHeader::new(JSON_INDEX_TYPE).to_bytes());
    prefix.push(status.to_byte());
    for value in [
        dict_offset as u32,
        dict.len() as u32,
        path_offset as u32,
        path_items.len() as u32,
        pv_offset as u32,
        pv_final.len() as u32,
        blob_offset as u32,
    ] {
        prefix.extend_from_slice(&value.to_le_bytes());
    }

    for s in &dict {
        prefix.extend_from_slice(&(s.len() as u16).to_le_bytes());
        prefix.extend_from_slice(s);
    }

    for &(final_id, provisional, count) in &path_items {
        prefix.extend_from_slice(&final_id.to_le_bytes());
        prefix.extend_from_slice(&(blob_size as u32).to_le_bytes());
        prefix.extend_from_slice(&count.to_le_bytes());
        path_slots.insert(provisional, WriteSlot::new(blob_offset + blob_size));
        blob_size += count as usize * 4;
    }

    for &(final_path, final_value, provisional, count) in &pv_final {
        prefix.extend_from_slice(&final_path.to_le_bytes());
        prefix.extend_from_slice(&final_value.to_le_bytes());
        prefix.extend_from_slice(&(blob_size as u32).to_le_bytes());
        prefix.extend_from_slice(&count.to_le_bytes());
        pv_slots.insert(provisional, WriteSlot::new(blob_offset + blob_size));
        blob_size += count as usize * 4;
    }

    let mut writer = PostingFileWriter::create(&artifact, blob_offset + blob_size)?;
    writer.write_at(0, &prefix)?;
    drop(prefix);

    // pass 2: stream positions to their computed offsets
    let mut record_paths: Vec<u32> = Vec::new();
    let mut record_pvs: Vec<(u32, u32)> = Vec::new();

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

        record_paths.clear();
        record_pvs.clear();
        {
            let interner = &interner;
            let record_paths = &mut record_paths;
            let record_pvs = &mut record_pvs;
            walk_json(
                &record.raw,
                &mut |path| {
                    if let Some(id) = interner.get(path) {
                        record_paths.push(id);
                    }
                },
                &mut |path, value| {
                    if let (Some(path_id), Some(value_id)) =
                        (interner.get(path), interner.get(value))
                    {
                        record_pvs.push((path_id, value_id));
                    }
                },
            );
        }

        for id in &record_paths {
            if let Some(slot) = path_slots.get_mut(id) {
                slot.write(&mut writer, pos)?;
            }
        }
        for ids in &record_pvs {
            if let Some(slot) = pv_slots.get_mut(ids) {
                slot.write(&mut writer, pos)?;
            }
        }
    }
    drop(cursor);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    writer.commit()?;

    log::debug!(
        "chunk {chunk_id}: json index built ({} paths, {} pv pairs, {status:?})",
        path_items.len(),
        pv_final.len()
    );

    Ok(())
}

/// Loaded JSON artifact.
pub struct JsonIndexReader {
    status: IndexStatus,
    dict: Vec<Vec<u8>>,
    paths: Vec<(u32, Vec<u32>)>,
    pvs: Vec<(u32, u32, Vec<u32>)>,
}

impl JsonIndexReader {
    pub fn open(chunk_dir: &Path) -> Result<Self> {
        let path = chunk_dir.join(JSON_INDEX_NAME);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::IndexNotFound(path));
            }
            Err(err) => return Err(err.into()),
        };

        if data.len() < FIXED_PREFIX {
            return Err(Error::IndexTooSmall {
                size: data.len() as u64,
            });
        }

        let header = IndexHeader::from_bytes(data[0..4].try_into().unwrap());
        header.check(JSON_INDEX_TYPE)?;
        let status = IndexStatus::from_byte(data[4])?;

        let mut table = [0u32; 7];
        for (idx, value) in table.iter_mut().enumerate() {
            let start = 5 + idx * 4;
            *value = u32::from_le_bytes(data[start..start + 4].try_into().unwrap());
        }
        let [dict_offset, dict_count, path_offset, path_count, pv_offset, pv_count, blob_offset] =
            table.map(|v| v as usize);

        if dict_offset != FIXED_PREFIX
            || path_offset < dict_offset
            || pv_offset != path_offset + path_count * PATH_ENTRY_SIZE
            || blob_offset != pv_offset + pv_count * PV_ENTRY_SIZE
            || blob_offset > data.len()
        {
            return Err(Error::StringSizeMismatch);
        }

        let mut dict = Vec::with_capacity(dict_count);
        let mut cursor = dict_offset;
        for _ in 0..dict_count {
            if cursor + 2 > path_offset {
                return Err(Error::StringSizeMismatch);
            }
            let len = u16::from_le_bytes(data[cursor..cursor + 2].try_into().unwrap()) as usize;
            cursor += 2;
            if cursor + len > path_offset {
                return Err(Error::StringSizeMismatch);
            }
            dict.push(data[cursor..cursor + len].to_vec());
            cursor += len;
        }
        if cursor != path_offset {
            return Err(Error::StringSizeMismatch);
        }

        let blob = &data[blob_offset..];
        let mut blob_extent = 0usize;
        let mut read_positions = |rel: usize, count: usize| -> Result<Vec<u32>> {
            let end = rel + count * 4;
            if end > blob.len() {
                return Err(Error::PostingSizeMismatch);
            }
            blob_extent = blob_extent.max(end);
            Ok(blob[rel..end]
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
                .collect())
        };

        let mut paths = Vec::with_capacity(path_count);
        for idx in 0..path_count {
            let start = path_offset + idx * PATH_ENTRY_SIZE;
            let dict_id = u32::from_le_bytes(data[start..start + 4].try_into().unwrap());
            let rel = u32::from_le_bytes(data[start + 4..start + 8].try_into().unwrap()) as usize;
            let count = u32::from_le_bytes(data[start + 8..start + 12].try_into().unwrap()) as usize;
            if dict_id as usize >= dict.len() {
                return Err(Error::StringSizeMismatch);
            }
            paths.push((dict_id, read_positions(rel, count)?));
        }

        let mut pvs = Vec::with_capacity(pv_count);
        for idx in 0..pv_count {
            let start = pv_offset + idx * PV_ENTRY_SIZE;
            let path_id = u32::from_le_bytes(data[start..start + 4].try_into().unwrap());
            let value_id = u32::from_le_bytes(data[start + 4..start + 8].try_into().unwrap());
            let rel = u32::from_le_bytes(data[start + 8..start + 12].try_into().unwrap()) as usize;
            let count =
                u32::from_le_bytes(data[start + 12..start + 16].try_into().unwrap()) as usize;
            if path_id as usize >= dict.len() || value_id as usize >= dict.len() {
                return Err(Error::StringSizeMismatch);
            }
            pvs.push((path_id, value_id, read_positions(rel, count)?));
        }

        if blob_extent != blob.len() {
            return Err(Error::PostingSizeMismatch);
        }

        Ok(Self {
            status,
            dict,
            paths,
            pvs,
        })
    }

    pub fn status(&self) -> IndexStatus {
        self.status
    }

    pub fn is_capped(&self) -> bool {
        self.status.is_capped()
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    pub fn pv_count(&self) -> usize {
        self.pvs.len()
    }

    fn dict_id(&self, s: &[u8]) -> Option<u32> {
        self.dict
            .binary_search_by(|entry| entry.as_slice().cmp(s))
            .ok()
            .map(|idx| idx as u32)
    }

    pub fn lookup_path(&self, path: &[u8]) -> Option<&[u32]> {
        let id = self.dict_id(path)?;
        self.paths
            .binary_search_by_key(&id, |&(dict_id, _)| dict_id)
            .ok()
            .map(|idx| self.paths[idx].1.as_slice())
    }

    pub fn lookup_path_value(&self, path: &[u8], value: &[u8]) -> Option<&[u32]> {
        let path_id = self.dict_id(path)?;
        let value_id = self.dict_id(value)?;
        self.pvs
            .binary_search_by_key(&(path_id, value_id), |&(p, v, _)| (p, v))
            .ok()
            .map(|idx| self.pvs[idx].2.as_slice())
    }

    /// Sorted, deduplicated union of positions over paths equal to
    /// `prefix` or continuing below it (NUL is a segment boundary).
    pub fn lookup_path_prefix(&self, prefix: &[u8]) -> Vec<u32> {
        let start = self
            .paths
            .partition_point(|&(dict_id, _)| self.dict[dict_id as usize].as_slice() < prefix);

        let mut union = Vec::new();
        for (dict_id, positions) in &self.paths[start..] {
            let path = self.dict[*dict_id as usize].as_slice();
            let matches = path == prefix
                || (path.starts_with(prefix) && path.get(prefix.len()) == Some(&PATH_SEPARATOR));
            if !matches {
                break;
            }
            union.extend_from_slice(positions);
        }

        union.sort_unstable();
        union.dedup();
        union
    }
}
