//! Indexer dispatch: runs one indexer family against one sealed chunk,
//! inspects artifact completeness and cleans up.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use loghive_tools::kv_extract::{EqualsPairExtractor, KvExtractor};

use crate::attr_index::build_attr_indexes;
use crate::chunk_manager::ChunkManager;
use crate::chunk_meta::{ChunkId, ChunkMeta};
use crate::error::{Error, Result};
use crate::file_formats::{
    tmp_path, IndexHeader, ATTR_KEY_INDEX_NAME, ATTR_KV_INDEX_NAME, ATTR_VALUE_INDEX_NAME,
    INDEX_FLAG_COMPLETE, INDEX_MAGIC, INGEST_TSIDX_NAME, JSON_INDEX_NAME, KV_KEY_INDEX_NAME,
    KV_KV_INDEX_NAME, KV_VALUE_INDEX_NAME, SOURCE_ID_INDEX_NAME, SOURCE_TSIDX_NAME, TMP_SUFFIX,
    TOKEN_INDEX_NAME,
};
use crate::json_index::{build_json_index, JsonIndexConfig};
use crate::kv_index::{build_kv_indexes, KvIndexConfig};
use crate::source_index::build_source_id_index;
use crate::token_index::{build_token_index, TokenIndexConfig};
use crate::tsidx::build_timestamp_indexes;

/// The indexer families a build can request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexerKind {
    Token,
    Attr,
    Kv,
    Json,
    Timestamp,
    SourceId,
}

impl IndexerKind {
    pub const ALL: [IndexerKind; 6] = [
        IndexerKind::Token,
        IndexerKind::Attr,
        IndexerKind::Kv,
        IndexerKind::Json,
        IndexerKind::Timestamp,
        IndexerKind::SourceId,
    ];

    /// Artifact files this family publishes into the chunk directory.
    pub fn artifact_names(self) -> &'static [&'static str] {
        match self {
            IndexerKind::Token => &[TOKEN_INDEX_NAME],
            IndexerKind::Attr => &[
                ATTR_KEY_INDEX_NAME,
                ATTR_VALUE_INDEX_NAME,
                ATTR_KV_INDEX_NAME,
            ],
            IndexerKind::Kv => &[KV_KEY_INDEX_NAME, KV_VALUE_INDEX_NAME, KV_KV_INDEX_NAME],
            IndexerKind::Json => &[JSON_INDEX_NAME],
            IndexerKind::Timestamp => &[INGEST_TSIDX_NAME, SOURCE_TSIDX_NAME],
            IndexerKind::SourceId => &[SOURCE_ID_INDEX_NAME],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct IndexerConfig {
    pub token: TokenIndexConfig,
    pub kv: KvIndexConfig,
    pub json: JsonIndexConfig,
}

/// Bundles everything needed to build indexes for a chunk manager's
/// chunks: the manager itself, the artifact base directory and the
/// per-family configuration.
pub struct Indexer {
    manager: Arc<dyn ChunkManager>,
    base: PathBuf,
    extractor: Arc<dyn KvExtractor>,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(manager: Arc<dyn ChunkManager>, base: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            base: base.into(),
            extractor: Arc::new(EqualsPairExtractor),
            config: IndexerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn KvExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn chunk_dir(&self, chunk_id: &ChunkId) -> PathBuf {
        self.base.join(chunk_id.to_string())
    }

    /// Runs one indexer family against a sealed chunk.
    pub fn run(
        &self,
        kind: IndexerKind,
        chunk_id: &ChunkId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dir = self.chunk_dir(chunk_id);
        std::fs::create_dir_all(&dir)?;

        let manager = &*self.manager;
        match kind {
            IndexerKind::Token => {
                build_token_index(manager, chunk_id, &dir, &self.config.token, cancel)
            }
            IndexerKind::Attr => build_attr_indexes(manager, chunk_id, &dir, cancel),
            IndexerKind::Kv => build_kv_indexes(
                manager,
                chunk_id,
                &dir,
                &*self.extractor,
                &self.config.kv,
                cancel,
            ),
            IndexerKind::Json => {
                build_json_index(manager, chunk_id, &dir, &self.config.json, cancel)
            }
            IndexerKind::Timestamp => build_timestamp_indexes(manager, chunk_id, &dir, cancel),
            IndexerKind::SourceId => build_source_id_index(manager, chunk_id, &dir, cancel),
        }
    }

    /// Whether every artifact of every family is present and marked
    /// complete. Sweeps leftover temp files as a side effect.
    pub fn indexes_complete(&self, chunk_id: &ChunkId) -> Result<bool> {
        let dir = self.chunk_dir(chunk_id);
        sweep_temp_files(&dir)?;

        for kind in IndexerKind::ALL {
            for name in kind.artifact_names() {
                if !artifact_is_complete(&dir.join(name))? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Removes all index artifacts (and temp leftovers) of a chunk; the
    /// record log and metadata stay untouched.
    pub fn delete_indexes(&self, chunk_id: &ChunkId) -> Result<()> {
        let dir = self.chunk_dir(chunk_id);

        for kind in IndexerKind::ALL {
            for name in kind.artifact_names() {
                let path = dir.join(name);
                remove_if_present(&path)?;
                remove_if_present(&tmp_path(&path))?;
            }
        }

        log::info!("deleted indexes of chunk {chunk_id}");
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Light artifact inspection: present, signed and carrying the complete
/// flag. Content level validation is left to the readers.
fn artifact_is_complete(path: &Path) -> Result<bool> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };

    let mut bytes = [0u8; 4];
    if file.read_exact(&mut bytes).is_err() {
        return Ok(false);
    }
    let header = IndexHeader::from_bytes(bytes);
    Ok(header.magic == INDEX_MAGIC && header.flags & INDEX_FLAG_COMPLETE != 0)
}

/// Removes `*.tmp` leftovers of interrupted builds below `base`. Called
/// on manager init and before completeness inspection.
pub fn sweep_temp_files(base: &Path) -> Result<usize> {
    let mut swept = 0;

    for entry in walkdir::WalkDir::new(base).min_depth(1).max_depth(2) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("temp sweep: cannot inspect below {base:?} - {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_str()
            .map(|name| name.ends_with(TMP_SUFFIX))
            .unwrap_or(false)
        {
            remove_if_present(entry.path())?;
            swept += 1;
        }
    }

    if swept > 0 {
        log::info!("swept {swept} leftover temp files below {base:?}");
    }
    Ok(swept)
}

/// All builders refuse to index unsealed chunks.
pub(crate) fn check_sealed(manager: &dyn ChunkManager, chunk_id: &ChunkId) -> Result<ChunkMeta> {
    let meta = manager.meta(chunk_id)?;
    if !meta.sealed {
        return Err(Error::ChunkNotSealed(chunk_id.clone()));
    }
    Ok(meta)
}

/// Posting positions are `u32`; the per-chunk rotation budgets keep real
/// chunks far below that, so an overflow is a corrupt position.
pub(crate) fn check_position(pos: u64) -> Result<u32> {
    u32::try_from(pos).map_err(|_| Error::PositionOutOfRange(pos))
}
