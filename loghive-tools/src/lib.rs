//! Shared tooling for loghive components.
//!
//! The record-scanning primitives here (tokenizer, kv extractors, JSON
//! walker) are consumed by the index builders in `loghive-datastore`; the
//! broadcast future backs the index build coordinator.

pub mod broadcast_future;
pub mod json_walk;
pub mod kv_extract;
pub mod tokenize;

pub use broadcast_future::BroadcastFuture;
