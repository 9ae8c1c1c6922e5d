//! Build coordinator: at most one physical index build per chunk, fanned
//! out over the requested indexer families, with the result broadcast to
//! every waiter.
//!
//! A caller's cancellation token only cancels that caller's wait; the
//! physical build keeps running and serves the remaining waiters. Builds
//! for distinct chunks proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use loghive_tools::BroadcastFuture;

use crate::chunk_meta::ChunkId;
use crate::error::{Error, Result};
use crate::indexer::{Indexer, IndexerKind};

type BuildResult = Result<()>;
type BuildMap = Arc<Mutex<HashMap<ChunkId, Arc<BroadcastFuture<BuildResult>>>>>;

pub struct BuildCoordinator {
    indexer: Arc<Indexer>,
    builds: BuildMap,
    /// Parent of every physical build's token; cancelling it stops all
    /// builds at shutdown.
    shutdown: CancellationToken,
}

impl BuildCoordinator {
    pub fn new(indexer: Arc<Indexer>) -> Self {
        Self {
            indexer,
            builds: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stops all physical builds; pending waiters get their build's
    /// (likely `Cancelled`) result.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs `kinds` against `chunk_id`, joining an in-flight build for the
    /// same chunk if one exists. Blocks until the build finishes or
    /// `cancel` fires; cancelling only abandons this caller's wait.
    pub async fn build(
        &self,
        cancel: CancellationToken,
        chunk_id: &ChunkId,
        kinds: &[IndexerKind],
    ) -> Result<()> {
        let group = {
            let mut builds = self.builds.lock().unwrap();
            match builds.get(chunk_id) {
                Some(group) => group.clone(),
                None => {
                    let group = Arc::new(BroadcastFuture::new(run_build(
                        self.indexer.clone(),
                        self.builds.clone(),
                        chunk_id.clone(),
                        kinds.to_vec(),
                        self.shutdown.child_token(),
                    )));
                    builds.insert(chunk_id.clone(), group.clone());
                    group
                }
            }
        };

        let listener = group.listen();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = listener => result.unwrap_or(Err(Error::Cancelled)),
        }
    }
}

async fn run_build(
    indexer: Arc<Indexer>,
    builds: BuildMap,
    chunk_id: ChunkId,
    kinds: Vec<IndexerKind>,
    cancel: CancellationToken,
) -> BuildResult {
    let mut handles = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let indexer = indexer.clone();
        let chunk_id = chunk_id.clone();
        let cancel = cancel.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            indexer.run(kind, &chunk_id, &cancel)
        }));
    }

    // first error observed wins; remaining indexers still run to
    // completion so their temp files get cleaned up on their own terms
    let mut result: BuildResult = Ok(());
    for handle in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(err) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("index build task failed - {err}"),
            )
            .into()),
        };
        if let Err(err) = outcome {
            if result.is_ok() {
                result = Err(err);
            }
        }
    }

    builds.lock().unwrap().remove(&chunk_id);

    if let Err(ref err) = result {
        log::warn!("index build for chunk {chunk_id} failed - {err}");
    }
    result
}
