//! Token index: `token -> [record positions]` over the raw payload.
//!
//! Two passes over the chunk. The first interns every distinct token once
//! and counts, with record-local deduplication, how many records contain
//! it. That fixes the exact artifact layout, so the second pass streams
//! each position directly to its final file offset; peak memory is bounded
//! by the distinct-token table, not by total occurrences.

use std::collections::BTreeMap;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use loghive_tools::tokenize::for_each_token;

use crate::chunk_manager::ChunkManager;
use crate::chunk_meta::ChunkId;
use crate::error::{Error, Result};
use crate::file_formats::{IndexHeader, TOKEN_INDEX_NAME, TOKEN_INDEX_TYPE};
use crate::indexer::{check_position, check_sealed};
use crate::inverted_index::{InvertedIndexReader, KeyEntry};
use crate::posting_file::PostingFileWriter;

#[derive(Clone, Debug)]
pub struct TokenIndexConfig {
    /// Tokens are truncated to this many bytes.
    pub max_token_len: usize,
}

impl Default for TokenIndexConfig {
    fn default() -> Self {
        Self { max_token_len: 16 }
    }
}

struct TokenSlot {
    count: u32,
    /// Absolute file offset of the next position of this token.
    offset: usize,
    written: u32,
    /// Last position charged to this token, for record-local dedup.
    seen_pos: u32,
}

pub fn build_token_index(
    manager: &dyn ChunkManager,
    chunk_id: &ChunkId,
    chunk_dir: &Path,
    config: &TokenIndexConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    check_sealed(manager, chunk_id)?;

    // pass 1: intern tokens, count one posting per containing record
    let mut tokens: BTreeMap<Vec<u8>, TokenSlot> = BTreeMap::new();
    let mut scratch = Vec::new();

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

        for_each_token(&record.raw, &mut scratch, config.max_token_len, |token| {
            if let Some(slot) = tokens.get_mut(token) {
                // positions are strictly increasing, so an equal position
                // means a duplicate within the current record
                if slot.seen_pos != pos {
                    slot.count += 1;
                    slot.seen_pos = pos;
                }
            } else {
                tokens.insert(
                    token.to_vec(),
                    TokenSlot {
                        count: 1,
                        offset: 0,
                        written: 0,
                        seen_pos: pos,
                    },
                );
            }
            true
        });
    }
    drop(cursor);

    // layout: header, entry count, string table, posting blob
    let mut table_size = 0;
    let mut blob_size = 0;
    for (token, slot) in tokens.iter() {
        table_size += 2 + token.len() + 8;
        blob_size += slot.count as usize * 4;
    }
    let blob_start = 8 + table_size;
    let total_size = blob_start + blob_size;

    let mut prefix = Vec::with_capacity(blob_start);
    prefix.extend_from_slice(&IndexHeader::new(TOKEN_INDEX_TYPE).to_bytes());
    prefix.extend_from_slice(&(tokens.len() as u32).to_le_bytes());

    let mut posting_offset = 0usize;
    for (token, slot) in tokens.iter_mut() {
        prefix.extend_from_slice(&(token.len() as u16).to_le_bytes());
        prefix.extend_from_slice(token);
        prefix.extend_from_slice(&(posting_offset as u32).to_le_bytes());
        prefix.extend_from_slice(&slot.count.to_le_bytes());

        slot.offset = blob_start + posting_offset;
        slot.written = 0;
        posting_offset += slot.count as usize * 4;
    }

    let path = chunk_dir.join(TOKEN_INDEX_NAME);
    let mut writer = PostingFileWriter::create(&path, total_size)?;
    writer.write_at(0, &prefix)?;
    drop(prefix);

    // pass 2: stream positions to their final offsets
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

        let mut failure = None;
        for_each_token(&record.raw, &mut scratch, config.max_token_len, |token| {
            let slot = match tokens.get_mut(token) {
                Some(slot) => slot,
                None => return true, // interned in pass 1, cannot happen
            };
            if slot.written > 0 && slot.seen_pos == pos {
                return true;
            }
            if let Err(err) = writer.write_u32_at(slot.offset + slot.written as usize * 4, pos) {
                failure = Some(err);
                return false;
            }
            slot.written += 1;
            slot.seen_pos = pos;
            true
        });
        if let Some(err) = failure {
            return Err(err);
        }
    }
    drop(cursor);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    writer.commit()?;

    log::debug!("chunk {chunk_id}: token index built ({} tokens)", tokens.len());

    Ok(())
}

/// Loaded token artifact.
pub struct TokenIndexReader {
    inner: InvertedIndexReader<KeyEntry>,
}

impl TokenIndexReader {
    pub fn open(chunk_dir: &Path) -> Result<Self> {
        let inner = InvertedIndexReader::open(
            &chunk_dir.join(TOKEN_INDEX_NAME),
            TOKEN_INDEX_TYPE,
            false,
        )?;
        Ok(Self { inner })
    }

    /// Exact token lookup; the probe is matched verbatim (tokens are
    /// stored lower case).
    pub fn lookup(&self, token: &[u8]) -> Option<&[u32]> {
        self.inner.lookup(token)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
