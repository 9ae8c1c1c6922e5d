//! Generic inverted index codec shared by the token, attribute, kv and
//! source id indexes.
//!
//! Layout after the common artifact header (and optional status byte):
//!
//! ```text
//! [entry_count: u32]
//! [string table, entry_count entries]
//! [posting blob, concatenated u32 positions]
//! ```
//!
//! A string table entry is `len:u16, key_bytes` (plus `len:u16, val_bytes`
//! for kv shaped indexes) followed by `posting_offset:u32` (byte offset
//! into the posting blob) and `posting_count:u32`. Entries are sorted by
//! key, then value, so lookups are a binary search.

use std::path::Path;

use crate::error::{Error, Result};
use crate::file_formats::{tmp_path, IndexHeader, IndexStatus};

/// One entry of a generic inverted index.
pub trait IndexEntry: Sized {
    /// Entries carry a `(key, value)` pair instead of a bare key.
    const HAS_VALUE: bool;

    fn key(&self) -> &[u8];
    fn value(&self) -> Option<&[u8]>;
    fn positions(&self) -> &[u32];
    fn from_parts(key: Vec<u8>, value: Option<Vec<u8>>, positions: Vec<u32>) -> Self;
}

/// `key -> positions` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    pub key: Vec<u8>,
    pub positions: Vec<u32>,
}

impl IndexEntry for KeyEntry {
    const HAS_VALUE: bool = false;

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn value(&self) -> Option<&[u8]> {
        None
    }

    fn positions(&self) -> &[u32] {
        &self.positions
    }

    fn from_parts(key: Vec<u8>, _value: Option<Vec<u8>>, positions: Vec<u32>) -> Self {
        Self { key, positions }
    }
}

/// `(key, value) -> positions` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub positions: Vec<u32>,
}

impl IndexEntry for KvEntry {
    const HAS_VALUE: bool = true;

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn value(&self) -> Option<&[u8]> {
        Some(&self.value)
    }

    fn positions(&self) -> &[u32] {
        &self.positions
    }

    fn from_parts(key: Vec<u8>, value: Option<Vec<u8>>, positions: Vec<u32>) -> Self {
        Self {
            key,
            value: value.unwrap_or_default(),
            positions,
        }
    }
}

/// Exact encoded size of a key entry, the admission currency of the
/// budgeted builders.
pub fn key_entry_cost(key_len: usize, posting_count: usize) -> usize {
    2 + key_len + 8 + posting_count * 4
}

/// Exact encoded size of a kv entry.
pub fn kv_entry_cost(key_len: usize, value_len: usize, posting_count: usize) -> usize {
    2 + key_len + 2 + value_len + 8 + posting_count * 4
}

/// Serializes `entries` (sorted here, by key then value) into a complete
/// artifact image.
pub fn encode<E: IndexEntry>(
    index_type: u8,
    status: Option<IndexStatus>,
    mut entries: Vec<E>,
) -> Vec<u8> {
    entries.sort_by(|a, b| (a.key(), a.value()).cmp(&(b.key(), b.value())));

    let mut table_size = 0;
    let mut blob_size = 0;
    for entry in &entries {
        table_size += 2 + entry.key().len() + 8;
        if let Some(value) = entry.value() {
            table_size += 2 + value.len();
        }
        blob_size += entry.positions().len() * 4;
    }

    let status_len = usize::from(status.is_some());
    let mut buf = Vec::with_capacity(4 + status_len + 4 + table_size + blob_size);

    buf.extend_from_slice(&IndexHeader::new(index_type).to_bytes());
    if let Some(status) = status {
        buf.push(status.to_byte());
    }
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());

    let mut posting_offset = 0u32;
    for entry in &entries {
        buf.extend_from_slice(&(entry.key().len() as u16).to_le_bytes());
        buf.extend_from_slice(entry.key());
        if let Some(value) = entry.value() {
            buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
            buf.extend_from_slice(value);
        }
        buf.extend_from_slice(&posting_offset.to_le_bytes());
        buf.extend_from_slice(&(entry.positions().len() as u32).to_le_bytes());
        posting_offset += (entry.positions().len() * 4) as u32;
    }

    for entry in &entries {
        for pos in entry.positions() {
            buf.extend_from_slice(&pos.to_le_bytes());
        }
    }

    buf
}

struct EntryMeta {
    key_start: usize,
    key_len: usize,
    value_start: usize,
    value_len: usize,
    posting_offset: usize,
    posting_count: usize,
}

fn read_u16(data: &[u8], cursor: &mut usize) -> Result<u16> {
    let end = *cursor + 2;
    if end > data.len() {
        return Err(Error::StringSizeMismatch);
    }
    let value = u16::from_le_bytes(data[*cursor..end].try_into().unwrap());
    *cursor = end;
    Ok(value)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = *cursor + 4;
    if end > data.len() {
        return Err(Error::StringSizeMismatch);
    }
    let value = u32::from_le_bytes(data[*cursor..end].try_into().unwrap());
    *cursor = end;
    Ok(value)
}

/// Decodes an artifact image. Two passes: scan the string table to locate
/// the posting blob, then materialize entries and positions.
pub fn decode<E: IndexEntry>(
    index_type: u8,
    with_status: bool,
    data: &[u8],
) -> Result<(Option<IndexStatus>, Vec<E>)> {
    let min_len = 4 + usize::from(with_status) + 4;
    if data.len() < min_len {
        return Err(Error::IndexTooSmall {
            size: data.len() as u64,
        });
    }

    let header = IndexHeader::from_bytes(data[0..4].try_into().unwrap());
    header.check(index_type)?;

    let mut cursor = 4;
    let status = if with_status {
        let status = IndexStatus::from_byte(data[cursor])?;
        cursor += 1;
        Some(status)
    } else {
        None
    };

    let entry_count = read_u32(data, &mut cursor)? as usize;

    let mut metas = Vec::with_capacity(entry_count);
    let mut blob_extent = 0;
    for _ in 0..entry_count {
        let key_len = read_u16(data, &mut cursor)? as usize;
        let key_start = cursor;
        cursor += key_len;

        let (value_start, value_len) = if E::HAS_VALUE {
            if cursor > data.len() {
                return Err(Error::StringSizeMismatch);
            }
            let value_len = read_u16(data, &mut cursor)? as usize;
            let value_start = cursor;
            cursor += value_len;
            (value_start, value_len)
        } else {
            (0, 0)
        };

        if cursor > data.len() {
            return Err(Error::StringSizeMismatch);
        }

        let posting_offset = read_u32(data, &mut cursor)? as usize;
        let posting_count = read_u32(data, &mut cursor)? as usize;
        blob_extent = blob_extent.max(posting_offset + posting_count * 4);

        metas.push(EntryMeta {
            key_start,
            key_len,
            value_start,
            value_len,
            posting_offset,
            posting_count,
        });
    }

    let blob_start = cursor;
    if blob_extent != data.len() - blob_start {
        return Err(Error::PostingSizeMismatch);
    }

    let mut entries = Vec::with_capacity(entry_count);
    for meta in metas {
        let key = data[meta.key_start..meta.key_start + meta.key_len].to_vec();
        let value = E::HAS_VALUE
            .then(|| data[meta.value_start..meta.value_start + meta.value_len].to_vec());

        let start = blob_start + meta.posting_offset;
        let positions = data[start..start + meta.posting_count * 4]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        entries.push(E::from_parts(key, value, positions));
    }

    Ok((status, entries))
}

/// Writes a fully assembled artifact image next to `path` and publishes it
/// with an atomic rename.
pub(crate) fn write_index_file(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Loaded artifact with binary-search lookups. The whole image is read at
/// open; lookups take no locks.
pub struct InvertedIndexReader<E> {
    status: Option<IndexStatus>,
    entries: Vec<E>,
}

impl<E: IndexEntry> InvertedIndexReader<E> {
    pub fn open(path: &Path, index_type: u8, with_status: bool) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::IndexNotFound(path.to_owned()));
            }
            Err(err) => return Err(err.into()),
        };
        let (status, entries) = decode(index_type, with_status, &data)?;
        Ok(Self { status, entries })
    }

    pub fn status(&self) -> Option<IndexStatus> {
        self.status
    }

    pub fn is_capped(&self) -> bool {
        matches!(self.status, Some(IndexStatus::Capped))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    /// Exact lookup for key shaped indexes.
    pub fn lookup(&self, key: &[u8]) -> Option<&[u32]> {
        self.entries
            .binary_search_by(|entry| (entry.key(), entry.value()).cmp(&(key, None)))
            .ok()
            .map(|idx| self.entries[idx].positions())
    }

    /// Exact lookup for kv shaped indexes.
    pub fn lookup_kv(&self, key: &[u8], value: &[u8]) -> Option<&[u32]> {
        self.entries
            .binary_search_by(|entry| (entry.key(), entry.value()).cmp(&(key, Some(value))))
            .ok()
            .map(|idx| self.entries[idx].positions())
    }
}

/// A candidate for budgeted admission; `index` is the caller's handle back
/// to the entry.
pub struct AdmissionCandidate {
    pub index: usize,
    pub count: usize,
    pub cost: usize,
}

/// Frequency-ordered admission: candidates sorted by descending posting
/// count (ties by ascending cost), admitted while they fit, stopping at
/// the first one that does not.
///
/// Returns the admitted `index` handles and whether admission was capped.
/// Callers pass candidates in a deterministic order so full ties resolve
/// identically across builds.
pub fn admit_by_frequency(
    mut candidates: Vec<AdmissionCandidate>,
    budget: usize,
) -> (Vec<usize>, bool) {
    candidates.sort_by(|a, b| b.count.cmp(&a.count).then(a.cost.cmp(&b.cost)));

    let mut admitted = Vec::with_capacity(candidates.len());
    let mut total = 0;
    for candidate in &candidates {
        if total + candidate.cost > budget {
            return (admitted, true);
        }
        total += candidate.cost;
        admitted.push(candidate.index);
    }

    (admitted, false)
}
