use std::path::PathBuf;
use std::sync::Arc;

use crate::chunk_meta::ChunkId;

/// Error kinds surfaced by the storage and indexing layer.
///
/// The enum is `Clone` (io causes are `Arc`-wrapped) so the build
/// coordinator can fan a single result out to multiple waiters.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("chunk '{0}' not found")]
    ChunkNotFound(ChunkId),

    #[error("chunk '{0}' is not sealed")]
    ChunkNotSealed(ChunkId),

    #[error("chunk '{0}' is the active chunk")]
    ActiveChunk(ChunkId),

    #[error("append_preserved requires a non-zero write timestamp")]
    MissingWriteTs,

    /// Terminal cursor signal, not a fault.
    #[error("no more records")]
    NoMoreRecords,

    #[error("position {0} is out of range")]
    PositionOutOfRange(u64),

    #[error("index file {0:?} not found")]
    IndexNotFound(PathBuf),

    #[error("index too small ({size} bytes)")]
    IndexTooSmall { size: u64 },

    #[error("invalid index signature")]
    SignatureMismatch,

    #[error("unexpected index type (expected {expected:#04x}, got {got:#04x})")]
    TypeMismatch { expected: u8, got: u8 },

    #[error("unsupported index version {got}")]
    VersionMismatch { got: u8 },

    #[error("index is marked incomplete")]
    Incomplete,

    #[error("invalid index status byte {0:#04x}")]
    InvalidStatus(u8),

    #[error("string table does not match declared size")]
    StringSizeMismatch,

    #[error("posting blob does not match declared size")]
    PostingSizeMismatch,

    #[error("index belongs to a different chunk")]
    ChunkIdMismatch,

    #[error("cancelled")]
    Cancelled,

    #[error("meta store failure: {0}")]
    MetaStore(String),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Io(Arc::new(err.into()))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
