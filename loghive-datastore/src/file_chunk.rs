//! File backed chunk manager: each chunk owns a directory holding its
//! record log, metadata and index artifacts. Positions are frame byte
//! offsets into `records.log`.
//!
//! The record log is append-only; per-chunk offset and write-ts tables are
//! kept in RAM and rebuilt by a sequential scan on open. Chunks left
//! unsealed by an unclean shutdown are sealed during open, and leftover
//! artifact temp files are swept.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use proxmox_io::{ReadExt, WriteExt};

use crate::chunk_manager::{stamp_write_ts, ChunkManager, Cursor};
use crate::chunk_meta::{ActiveChunkState, ChunkId, ChunkMeta};
use crate::error::{Error, Result};
use crate::file_formats::{RecordFrameHeader, RECORD_FRAME_HEADER_SIZE, RECORD_LOG_NAME};
use crate::indexer::sweep_temp_files;
use crate::meta_store::{FileMetaStore, MetaStore};
use crate::record::{Record, RecordRef, SourceId};
use crate::rotation::RotationPolicy;

fn encode_record_frame(record: &Record) -> Result<Vec<u8>> {
    if record.attrs.len() > u16::MAX as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "too many attributes for one record",
        )
        .into());
    }

    let mut body_len = record.raw.len();
    for (key, value) in &record.attrs {
        if key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "attribute too long for one record",
            )
            .into());
        }
        body_len += 4 + key.len() + value.len();
    }

    let frame_len = RECORD_FRAME_HEADER_SIZE + body_len;
    let header = RecordFrameHeader {
        frame_len: frame_len as u32,
        write_ts: record.write_ts,
        ingest_ts: record.ingest_ts,
        source_ts: record.source_ts,
        source_id: *record.source_id.as_bytes(),
        attr_count: record.attrs.len() as u16,
        raw_len: record.raw.len() as u32,
    };

    let mut buf = Vec::with_capacity(frame_len);
    unsafe { buf.write_le_value(header)? };
    for (key, value) in &record.attrs {
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf.extend_from_slice(&record.raw);

    Ok(buf)
}

fn corrupt(msg: &str) -> Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string()).into()
}

/// Reads the frame at the reader's current position.
fn read_record_frame(file: &mut File) -> Result<(Record, usize)> {
    let header: RecordFrameHeader = unsafe { file.read_le_value()? };

    let frame_len = header.frame_len as usize;
    if frame_len < RECORD_FRAME_HEADER_SIZE {
        return Err(corrupt("record frame shorter than its header"));
    }

    let mut remaining = frame_len - RECORD_FRAME_HEADER_SIZE;
    let mut attrs = HashMap::with_capacity(header.attr_count as usize);
    for _ in 0..header.attr_count {
        let key_len = unsafe { file.read_le_value::<u16>()? } as usize;
        let key = file.read_exact_allocated(key_len)?;
        let value_len = unsafe { file.read_le_value::<u16>()? } as usize;
        let value = file.read_exact_allocated(value_len)?;

        let used = 4 + key_len + value_len;
        if used > remaining {
            return Err(corrupt("record frame attributes overrun the frame"));
        }
        remaining -= used;

        let key = String::from_utf8(key).map_err(|_| corrupt("attribute key is not utf-8"))?;
        let value =
            String::from_utf8(value).map_err(|_| corrupt("attribute value is not utf-8"))?;
        attrs.insert(key, value);
    }

    if remaining != header.raw_len as usize {
        return Err(corrupt("record frame length mismatch"));
    }
    let raw = file.read_exact_allocated(remaining)?;

    Ok((
        Record {
            raw,
            attrs,
            ingest_ts: header.ingest_ts,
            write_ts: header.write_ts,
            source_ts: header.source_ts,
            source_id: SourceId::from_bytes(header.source_id),
        },
        frame_len,
    ))
}

/// Sequentially rebuilds the offset and write-ts tables of a record log.
/// A truncated trailing frame (crash during append) is dropped with a
/// warning.
fn scan_record_log(path: &Path) -> Result<(Vec<u64>, Vec<i64>, u64)> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), Vec::new(), 0));
        }
        Err(err) => return Err(err.into()),
    };

    let file_len = file.metadata()?.len();
    let mut offsets = Vec::new();
    let mut write_tss = Vec::new();
    let mut offset = 0u64;

    while offset + RECORD_FRAME_HEADER_SIZE as u64 <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        let header: RecordFrameHeader = unsafe { file.read_le_value()? };

        let frame_len = header.frame_len as u64;
        if frame_len < RECORD_FRAME_HEADER_SIZE as u64 || offset + frame_len > file_len {
            break;
        }

        offsets.push(offset);
        write_tss.push(header.write_ts);
        offset += frame_len;
    }

    if offset != file_len {
        log::warn!(
            "record log {path:?} has {} trailing bytes from an interrupted append, ignoring them",
            file_len - offset
        );
    }

    Ok((offsets, write_tss, offset))
}

struct FileChunk {
    meta: ChunkMeta,
    offsets: Vec<u64>,
    write_tss: Vec<i64>,
    writer: Option<File>,
    len: u64,
}

struct Inner {
    chunks: HashMap<ChunkId, FileChunk>,
    active: Option<ChunkId>,
}

pub struct FileChunkManager {
    base: PathBuf,
    inner: Mutex<Inner>,
    rotation: Option<Box<dyn RotationPolicy>>,
    meta_store: Arc<dyn MetaStore>,
}

impl FileChunkManager {
    pub fn open(base: impl Into<PathBuf>, rotation: Option<Box<dyn RotationPolicy>>) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        let meta_store: Arc<dyn MetaStore> = Arc::new(FileMetaStore::new(&base));
        Self::open_with_meta_store(base, rotation, meta_store)
    }

    pub fn open_with_meta_store(
        base: impl Into<PathBuf>,
        rotation: Option<Box<dyn RotationPolicy>>,
        meta_store: Arc<dyn MetaStore>,
    ) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;

        let mut chunks = HashMap::new();
        for mut meta in meta_store.list()? {
            let log_path = base.join(meta.id.to_string()).join(RECORD_LOG_NAME);
            let (offsets, write_tss, len) = scan_record_log(&log_path)?;

            if !meta.sealed {
                log::warn!("sealing chunk {} left active by an unclean shutdown", meta.id);
                meta.sealed = true;
                meta_store.save(&meta)?;
            }
            if offsets.len() as u64 != meta.record_count {
                log::warn!(
                    "chunk {}: record log holds {} records but meta says {}",
                    meta.id,
                    offsets.len(),
                    meta.record_count
                );
            }

            chunks.insert(
                meta.id.clone(),
                FileChunk {
                    meta,
                    offsets,
                    write_tss,
                    writer: None,
                    len,
                },
            );
        }

        sweep_temp_files(&base)?;

        Ok(Self {
            base,
            inner: Mutex::new(Inner {
                chunks,
                active: None,
            }),
            rotation,
            meta_store,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    fn chunk_dir(&self, id: &ChunkId) -> PathBuf {
        self.base.join(id.to_string())
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
            let dir = self.chunk_dir(&id);
            std::fs::create_dir_all(&dir)?;
            log::debug!("opening chunk {id} at {dir:?}");

            let writer = std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(dir.join(RECORD_LOG_NAME))?;

            inner.chunks.insert(
                id.clone(),
                FileChunk {
                    meta: ChunkMeta::new(id.clone()),
                    offsets: Vec::new(),
                    write_tss: Vec::new(),
                    writer: Some(writer),
                    len: 0,
                },
            );
            inner.active = Some(id);
        }

        let active_id = inner.active.clone().unwrap();
        let chunk = inner.chunks.get_mut(&active_id).unwrap();

        stamp_write_ts(&mut record, preserved, chunk.meta.end_ts)?;

        let frame = encode_record_frame(&record)?;
        let pos = chunk.len;

        let writer = chunk.writer.as_mut().expect("active chunk without writer");
        writer.write_all(&frame)?;

        let mut meta = chunk.meta.clone();
        meta.update_bounds(&record);
        if let Err(err) = self.meta_store.save(&meta) {
            // the append is aborted; take the frame back out of the log
            let _ = nix::unistd::ftruncate(writer.as_raw_fd(), pos as i64);
            let _ = writer.seek(SeekFrom::Start(pos));
            return Err(err);
        }

        chunk.offsets.push(pos);
        chunk.write_tss.push(record.write_ts);
        chunk.len += frame.len() as u64;
        chunk.meta = meta;

        Ok(RecordRef::new(active_id, pos))
    }

    fn seal_locked(inner: &mut Inner, meta_store: &dyn MetaStore) -> Result<()> {
        if let Some(active_id) = inner.active.take() {
            let chunk = inner.chunks.get_mut(&active_id).unwrap();
            if let Some(writer) = chunk.writer.take() {
                writer.sync_data()?;
            }
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

impl ChunkManager for FileChunkManager {
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

        let file = File::open(self.chunk_dir(id).join(RECORD_LOG_NAME))?;

        Ok(Box::new(FileCursor {
            chunk_id: id.clone(),
            file,
            offsets: chunk.offsets.clone(),
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
        match std::fs::remove_dir_all(self.chunk_dir(id)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        log::info!("deleted chunk {id}");

        Ok(())
    }

    fn find_start_position(&self, id: &ChunkId, ts: i64) -> Result<Option<u64>> {
        let inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get(id)
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))?;

        let idx = chunk.write_tss.partition_point(|&write_ts| write_ts <= ts);
        Ok(idx.checked_sub(1).map(|idx| chunk.offsets[idx]))
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
                    .offsets
                    .binary_search(&pos)
                    .map(|idx| chunk.write_tss[idx])
                    .map_err(|_| Error::PositionOutOfRange(pos))
            })
            .collect()
    }
}

struct FileCursor {
    chunk_id: ChunkId,
    file: File,
    offsets: Vec<u64>,
    next: usize,
}

impl FileCursor {
    fn read_at(&mut self, idx: usize) -> Result<(Record, RecordRef)> {
        let offset = self.offsets[idx];
        self.file.seek(SeekFrom::Start(offset))?;
        let (record, _) = read_record_frame(&mut self.file)?;
        Ok((record, RecordRef::new(self.chunk_id.clone(), offset)))
    }
}

impl Cursor for FileCursor {
    fn next(&mut self) -> Result<(Record, RecordRef)> {
        if self.next >= self.offsets.len() {
            return Err(Error::NoMoreRecords);
        }
        let item = self.read_at(self.next)?;
        self.next += 1;
        Ok(item)
    }

    fn prev(&mut self) -> Result<(Record, RecordRef)> {
        let prev = self.next.checked_sub(1).ok_or(Error::NoMoreRecords)?;
        self.next = prev;
        self.read_at(prev)
    }

    fn seek(&mut self, to: &RecordRef) -> Result<()> {
        if to.chunk_id != self.chunk_id {
            return Err(Error::ChunkIdMismatch);
        }
        let idx = self
            .offsets
            .binary_search(&to.pos)
            .map_err(|_| Error::PositionOutOfRange(to.pos))?;
        self.next = idx;
        Ok(())
    }
}
