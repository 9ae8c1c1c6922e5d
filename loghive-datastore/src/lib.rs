//! This crate implements the chunked log storage and indexing layer.
//!
//! # Data model
//!
//! Incoming records are grouped into append-only **chunks**. A chunk
//! manager owns at most one active chunk at a time; a rotation policy
//! (record count, byte budget, age, or any combination) decides when the
//! active chunk is sealed and a fresh one opened. Sealing is terminal:
//! sealed chunks are immutable and become eligible for index building and
//! deletion.
//!
//! Two manager implementations share one contract: the memory variant
//! addresses records by index, the file variant by frame byte offset
//! within the chunk's `records.log`. Cursors iterate a stable snapshot in
//! both directions and never hold the manager mutex.
//!
//! # Index artifacts
//!
//! Once a chunk is sealed, per-chunk secondary indexes are built into the
//! chunk's directory, each published atomically via a temp file and a
//! rename:
//!
//! * `_token.idx` - token -> positions over the raw payload
//! * `_attr_key.idx`, `_attr_val.idx`, `_attr_kv.idx` - attribute indexes
//! * `_kv_key.idx`, `_kv_val.idx`, `_kv_kv.idx` - budgeted indexes over
//!   extracted `key=value` pairs
//! * `_json.idx` - JSON path and (path, value) index with a shared string
//!   dictionary
//! * `_ingest.idx`, `_source.idx` - timestamp seek indexes
//! * `_source_id.idx` - source id -> positions
//!
//! Every artifact starts with the same 4 byte header (magic, type,
//! version, flags); readers reject unknown types and versions as well as
//! artifacts missing the `complete` flag. The kv and json families carry
//! an additional status byte: budgeted admission may stop early, leaving
//! a *capped* index whose lookups stay sound while recall is reduced.
//!
//! # Locking
//!
//! Chunk manager state is guarded by a single mutex held for the duration
//! of each operation; meta stores are internally thread safe and may be
//! called under it. Index builders only take cursors and run outside the
//! mutex, so builds never block appends. The build coordinator
//! deduplicates concurrent build requests per chunk and fans the result
//! out to all waiters; cancellation is per waiter, never per build.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod attr_index;
pub mod chunk_manager;
pub mod chunk_meta;
pub mod coordinator;
pub mod error;
pub mod file_chunk;
pub mod file_formats;
pub mod indexer;
pub mod inverted_index;
pub mod json_index;
pub mod kv_index;
pub mod memory_chunk;
pub mod meta_store;
pub mod posting_file;
pub mod record;
pub mod rotation;
pub mod source_index;
pub mod token_index;
pub mod tsidx;

pub use chunk_manager::{ChunkManager, Cursor};
pub use chunk_meta::{ActiveChunkState, ChunkId, ChunkMeta};
pub use coordinator::BuildCoordinator;
pub use error::{Error, Result};
pub use file_chunk::FileChunkManager;
pub use indexer::{Indexer, IndexerConfig, IndexerKind};
pub use memory_chunk::MemoryChunkManager;
pub use meta_store::{FileMetaStore, MemoryMetaStore, MetaStore};
pub use record::{Record, RecordRef, SourceId};
pub use rotation::{
    AgePolicy, AnyOfPolicy, ByteBudgetPolicy, RecordCountPolicy, RotationPolicy, RotationReason,
};
