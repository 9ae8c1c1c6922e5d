//! Pluggable persistence for chunk metadata.
//!
//! The chunk manager saves metadata after every append and on seal; a
//! failed save aborts the append. Stores are internally thread safe and
//! may be invoked with the manager mutex held.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use proxmox_sys::fs::{replace_file, CreateOptions};

use crate::chunk_meta::{ChunkId, ChunkMeta};
use crate::error::{Error, Result};
use crate::file_formats::META_FILE_NAME;

pub trait MetaStore: Send + Sync {
    fn save(&self, meta: &ChunkMeta) -> Result<()>;
    fn load(&self, id: &ChunkId) -> Result<ChunkMeta>;
    fn list(&self) -> Result<Vec<ChunkMeta>>;
    fn remove(&self, id: &ChunkId) -> Result<()>;
}

/// Volatile store for tests and the memory chunk manager.
#[derive(Default)]
pub struct MemoryMetaStore {
    entries: Mutex<HashMap<ChunkId, ChunkMeta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn save(&self, meta: &ChunkMeta) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(meta.id.clone(), meta.clone());
        Ok(())
    }

    fn load(&self, id: &ChunkId) -> Result<ChunkMeta> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))
    }

    fn list(&self) -> Result<Vec<ChunkMeta>> {
        let mut list: Vec<ChunkMeta> = self.entries.lock().unwrap().values().cloned().collect();
        list.sort_by(|a, b| (a.created, &a.id).cmp(&(b.created, &b.id)));
        Ok(list)
    }

    fn remove(&self, id: &ChunkId) -> Result<()> {
        self.entries.lock().unwrap().remove(id);
        Ok(())
    }
}

/// Durable store: one `meta.json` per chunk directory, written atomically.
pub struct FileMetaStore {
    base: PathBuf,
}

impl FileMetaStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn meta_path(&self, id: &ChunkId) -> PathBuf {
        self.base.join(id.to_string()).join(META_FILE_NAME)
    }
}

impl MetaStore for FileMetaStore {
    fn save(&self, meta: &ChunkMeta) -> Result<()> {
        let path = self.meta_path(&meta.id);
        let dir = path.parent().unwrap();
        std::fs::create_dir_all(dir)?;

        let data = serde_json::to_vec_pretty(meta)
            .map_err(|err| Error::MetaStore(format!("serializing chunk meta failed - {err}")))?;

        replace_file(&path, &data, CreateOptions::new(), false)
            .map_err(|err| Error::MetaStore(format!("writing {path:?} failed - {err}")))?;

        Ok(())
    }

    fn load(&self, id: &ChunkId) -> Result<ChunkMeta> {
        let path = self.meta_path(id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ChunkNotFound(id.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice(&data)
            .map_err(|err| Error::MetaStore(format!("parsing {path:?} failed - {err}")))
    }

    fn list(&self) -> Result<Vec<ChunkMeta>> {
        let mut list = Vec::new();

        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let id: ChunkId = match name.to_str().and_then(|name| name.parse().ok()) {
                Some(id) => id,
                None => continue, // not a chunk directory
            };
            match self.load(&id) {
                Ok(meta) => list.push(meta),
                Err(Error::ChunkNotFound(_)) => {
                    log::warn!("chunk directory {name:?} has no meta file, skipping");
                }
                Err(err) => return Err(err),
            }
        }

        list.sort_by(|a, b| (a.created, &a.id).cmp(&(b.created, &b.id)));
        Ok(list)
    }

    fn remove(&self, id: &ChunkId) -> Result<()> {
        match std::fs::remove_file(self.meta_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryMetaStore::new();
        let meta = ChunkMeta::new(ChunkId::generate());

        store.save(&meta).unwrap();
        assert_eq!(store.load(&meta.id).unwrap().id, meta.id);
        assert_eq!(store.list().unwrap().len(), 1);

        store.remove(&meta.id).unwrap();
        assert!(matches!(
            store.load(&meta.id),
            Err(Error::ChunkNotFound(_))
        ));
    }
}
