//! In-RAM chunk manager: position is the record index, cursors snapshot
//! the append-only record storage at open time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::chunk_manager::{stamp_write_ts, ChunkManager, Cursor};
use crate::chunk_meta::{ActiveChunkState, ChunkId, ChunkMeta};
use crate::error::{Error, Result};
use crate::meta_store::{MemoryMetaStore, MetaStore};
use crate::record::{Record, RecordRef};
use crate::rotation::RotationPolicy;
use crate::tsidx::SparseWriteTsIndex;

/// Default stride of the sparse write-ts index.
pub const DEFAULT_SPARSE_STRIDE: usize = 64;

struct MemChunk {
    meta: ChunkMeta,
    records: Vec<Arc<Record>>,
    sparse: SparseWriteTsIndex,
}

struct Inner {
    chunks: HashMap<ChunkId, MemChunk>,
    active: Option<ChunkId>,
}

pub struct MemoryChunkManager {
    inner: Mutex<Inner>,
    rotation: Option<Box<dyn RotationPolicy>>,
    meta_store: Arc<dyn MetaStore>,
    sparse_stride: usize,
}

impl MemoryChunkManager {
    pub fn new(rotation: Option<Box<dyn RotationPolicy>>) -> Self {
        Self::with_meta_store(rotation, Arc::new(MemoryMetaStore::new()))
    }

    pub fn with_meta_store(
        rotation: Option<Box<dyn RotationPolicy>>,
        meta_store: Arc<dyn MetaStore>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunks: HashMap::new(),
                active: None,
            }),
            rotation,
            meta_store,
            sparse_stride: DEFAULT_SPARSE_STRIDE,
        }
    }

    pub fn set_sparse_stride(&mut self, stride: usize) {
        self.sparse_stride = stride.max(1);
    }

    /// Snapshot of the active chunk's sparse write-ts index positions, for
    /// query-side seeding of cursor seeks.
    pub fn sparse_index_len(&self, id: &ChunkId) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get(id)
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))?;
        Ok(chunk.sparse.len())
    }

    fn append_impl(&self, mut record: Record, preserved: bool) -> Result<RecordRef> {
        let mut inner = self.inner.lock().unwrap();

        if let (Some(active_id), Some(rotation)) = (inner.active.clone(), &self.rotation) {
            let chunk = inner.chunks.get(&active_id).unwrap();
            let state = ActiveChunkState::from(&chunk.meta);
            if let Some(reason) = rotation.check(&state, &record) {
                log::info!("rotating chunk {active_id} ({reason})");
                Self::seal_locked(&mut inner, &*self.meta_store)?;
            }
        }

        if inner.active.is_none() {
            let id = ChunkId::generate();
            log::debug!("opening chunk {id}");
            inner.chunks.insert(
                id.clone(),
                MemChunk {
                    meta: ChunkMeta::new(id.clone()),
                    records: Vec::new(),
                    sparse: SparseWriteTsIndex::new(self.sparse_stride),
                },
            );
            inner.active = Some(id);
        }

        let active_id = inner.active.clone().unwrap();
        let chunk = inner.chunks.get_mut(&active_id).unwrap();

        stamp_write_ts(&mut record, preserved, chunk.meta.end_ts)?;

        let mut meta = chunk.meta.clone();
        meta.update_bounds(&record);
        self.meta_store.save(&meta)?;

        let pos = chunk.records.len() as u64;
        if let Ok(pos32) = u32::try_from(pos) {
            chunk.sparse.observe(record.write_ts, pos32);
        }
        chunk.records.push(Arc::new(record));
        chunk.meta = meta;

        Ok(RecordRef::new(active_id, pos))
    }

    fn seal_locked(inner: &mut Inner, meta_store: &dyn MetaStore) -> Result<()> {
        if let Some(active_id) = inner.active.take() {
            let chunk = inner.chunks.get_mut(&active_id).unwrap();
            chunk.meta.sealed = true;
            meta_store.save(&chunk.meta)?;
            log::info!(
                "sealed chunk {active_id} ({} records, {} bytes)",
                chunk.meta.record_count,
                chunk.meta.byte_count
            );
        }
        Ok(())
    }
}

impl ChunkManager for MemoryChunkManager {
    fn append(&self, record: Record) -> Result<RecordRef> {
        self.append_impl(record, false)
    }

    fn append_preserved(&self, record: Record) -> Result<RecordRef> {
        self.append_impl(record, true)
    }

    fn seal(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::seal_locked(&mut inner, &*self.meta_store)
    }

    fn active(&self) -> Option<ChunkMeta> {
        let inner = self.inner.lock().unwrap();
        let active_id = inner.active.as_ref()?;
        Some(inner.chunks[active_id].meta.clone())
    }

    fn meta(&self, id: &ChunkId) -> Result<ChunkMeta> {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .get(id)
            .map(|chunk| chunk.meta.clone())
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))
    }

    fn list(&self) -> Result<Vec<ChunkMeta>> {
        let inner = self.inner.lock().unwrap();
        let mut list: Vec<ChunkMeta> =
            inner.chunks.values().map(|chunk| chunk.meta.clone()).collect();
        list.sort_by(|a, b| (a.created, &a.id).cmp(&(b.created, &b.id)));
        Ok(list)
    }

    fn open_cursor(&self, id: &ChunkId) -> Result<Box<dyn Cursor>> {
        let inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get(id)
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))?;

        Ok(Box::new(MemoryCursor {
            chunk_id: id.clone(),
            records: chunk.records.clone(),
            next: 0,
        }))
    }

    fn delete(&self, id: &ChunkId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.active.as_ref() == Some(id) {
            return Err(Error::ActiveChunk(id.clone()));
        }
        if inner.chunks.remove(id).is_none() {
            return Err(Error::ChunkNotFound(id.clone()));
        }
        self.meta_store.remove(id)?;
        log::info!("deleted chunk {id}");

        Ok(())
    }

    fn find_start_position(&self, id: &ChunkId, ts: i64) -> Result<Option<u64>> {
        let inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get(id)
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))?;

        match chunk.records.first() {
            Some(first) if first.write_ts <= ts => {}
            _ => return Ok(None), // empty, or ts predates the chunk
        }

        // the sparse index narrows the scan to at most one stride
        let start = chunk
            .sparse
            .find_latest(ts)
            .map(|(_, pos)| pos as usize)
            .unwrap_or(0);

        let mut found = start as u64;
        for (idx, record) in chunk.records[start..].iter().enumerate() {
            if record.write_ts > ts {
                break;
            }
            found = (start + idx) as u64;
        }

        Ok(Some(found))
    }

    fn read_write_timestamps(&self, id: &ChunkId, positions: &[u64]) -> Result<Vec<i64>> {
        let inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get(id)
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))?;

        positions
            .iter()
            .map(|&pos| {
                chunk
                    .records
                    .get(pos as usize)
                    .map(|record| record.write_ts)
                    .ok_or(Error::PositionOutOfRange(pos))
            })
            .collect()
    }
}

struct MemoryCursor {
    chunk_id: ChunkId,
    records: Vec<Arc<Record>>,
    next: usize,
}

impl Cursor for MemoryCursor {
    fn next(&mut self) -> Result<(Record, RecordRef)> {
        let record = self.records.get(self.next).ok_or(Error::NoMoreRecords)?;
        let record_ref = RecordRef::new(self.chunk_id.clone(), self.next as u64);
        self.next += 1;
        Ok(((**record).clone(), record_ref))
    }

    fn prev(&mut self) -> Result<(Record, RecordRef)> {
        let prev = self.next.checked_sub(1).ok_or(Error::NoMoreRecords)?;
        self.next = prev;
        let record = (*self.records[prev]).clone();
        Ok((record, RecordRef::new(self.chunk_id.clone(), prev as u64)))
    }

    fn seek(&mut self, to: &RecordRef) -> Result<()> {
        if to.chunk_id != self.chunk_id {
            return Err(Error::ChunkIdMismatch);
        }
        if to.pos >= self.records.len() as u64 {
            return Err(Error::PositionOutOfRange(to.pos));
        }
        self.next = to.pos as usize;
        Ok(())
    }
}
