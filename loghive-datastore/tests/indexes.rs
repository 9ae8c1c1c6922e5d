use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;
use tokio_util::sync::CancellationToken;

use loghive_datastore::attr_index::AttrIndexReader;
use loghive_datastore::error::Error as StoreError;
use loghive_datastore::json_index::JsonIndexReader;
use loghive_datastore::kv_index::KvIndexReader;
use loghive_datastore::source_index::SourceIdIndexReader;
use loghive_datastore::token_index::TokenIndexReader;
use loghive_datastore::tsidx::TsidxReader;
use loghive_datastore::{
    ChunkId, ChunkManager, Indexer, IndexerConfig, IndexerKind, MemoryChunkManager, Record,
    SourceId,
};

fn test_dir(name: &str) -> PathBuf {
    let mut path = std::fs::canonicalize(".").unwrap(); // we need absolute path
    path.push(format!(".testdir-idx-{name}"));
    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Appends `records` into one chunk, seals it and returns the pieces an
/// indexer needs.
fn sealed_chunk(records: Vec<Record>) -> (Arc<MemoryChunkManager>, ChunkId) {
    let manager = Arc::new(MemoryChunkManager::new(None));
    let mut chunk_id = None;
    for record in records {
        chunk_id = Some(manager.append(record).unwrap().chunk_id);
    }
    manager.seal().unwrap();
    (manager, chunk_id.expect("at least one record"))
}

fn record(raw: &str) -> Record {
    Record::new(raw, SourceId::generate())
}

#[test]
fn test_token_dedup_and_case_folding() -> Result<(), Error> {
    init_logging();
    let base = test_dir("token");

    let (manager, chunk_id) = sealed_chunk(vec![record("ERROR error Error")]);
    let indexer = Indexer::new(manager, &base);
    indexer.run(IndexerKind::Token, &chunk_id, &CancellationToken::new())?;

    let reader = TokenIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert_eq!(reader.lookup(b"error"), Some(&[0u32][..]));
    assert_eq!(reader.lookup(b"ERROR"), None);
    assert_eq!(reader.len(), 1);

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_token_index_is_idempotent() -> Result<(), Error> {
    init_logging();
    let base = test_dir("token-idem");

    let records = (0..20)
        .map(|i| record(&format!("request {} served in {}ms by worker-{}", i, i * 3, i % 4)))
        .collect();
    let (manager, chunk_id) = sealed_chunk(records);
    let indexer = Indexer::new(manager, &base);

    let artifact = indexer.chunk_dir(&chunk_id).join("_token.idx");

    indexer.run(IndexerKind::Token, &chunk_id, &CancellationToken::new())?;
    let first = std::fs::read(&artifact)?;

    indexer.run(IndexerKind::Token, &chunk_id, &CancellationToken::new())?;
    let second = std::fs::read(&artifact)?;

    assert_eq!(first, second, "token index build must be deterministic");

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_attr_kv_exact_match() -> Result<(), Error> {
    init_logging();
    let base = test_dir("attr");

    let (manager, chunk_id) = sealed_chunk(vec![
        record("r0").with_attr("env", "prod").with_attr("host", "srv1"),
        record("r1").with_attr("env", "prod").with_attr("host", "srv2"),
        record("r2").with_attr("env", "dev").with_attr("host", "srv1"),
    ]);
    let indexer = Indexer::new(manager, &base);
    indexer.run(IndexerKind::Attr, &chunk_id, &CancellationToken::new())?;

    let reader = AttrIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert_eq!(reader.kv_lookup(b"env", b"prod"), Some(&[0u32, 1][..]));
    assert_eq!(reader.kv_lookup(b"env", b"staging"), None);
    assert_eq!(reader.lookup_key(b"host"), Some(&[0u32, 1, 2][..]));
    assert_eq!(reader.lookup_value(b"srv1"), Some(&[0u32, 2][..]));

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_attr_posting_lists_are_deduplicated() -> Result<(), Error> {
    init_logging();
    let base = test_dir("attr-dedup");

    // two attributes share one value within a single record
    let (manager, chunk_id) = sealed_chunk(vec![
        record("r0").with_attr("left", "same").with_attr("right", "same"),
        record("r1").with_attr("left", "other"),
    ]);
    let indexer = Indexer::new(manager, &base);
    indexer.run(IndexerKind::Attr, &chunk_id, &CancellationToken::new())?;

    let reader = AttrIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert_eq!(reader.lookup_value(b"same"), Some(&[0u32][..]));
    assert_eq!(reader.lookup_key(b"left"), Some(&[0u32, 1][..]));

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_json_path_lookup() -> Result<(), Error> {
    init_logging();
    let base = test_dir("json");

    let (manager, chunk_id) = sealed_chunk(vec![
        record(r#"{"http":{"status":500}}"#),
        record(r#"{"http":{"status":200}}"#),
        record(r#"{"service":"web"}"#),
    ]);
    let indexer = Indexer::new(manager, &base);
    indexer.run(IndexerKind::Json, &chunk_id, &CancellationToken::new())?;

    let reader = JsonIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert!(!reader.is_capped());
    assert_eq!(reader.lookup_path(b"http\0status"), Some(&[0u32, 1][..]));
    assert_eq!(reader.lookup_path_prefix(b"http"), vec![0, 1]);
    assert_eq!(reader.lookup_path_value(b"http\0status", b"500"), Some(&[0u32][..]));
    assert_eq!(reader.lookup_path(b"service"), Some(&[2u32][..]));
    assert_eq!(reader.lookup_path(b"missing"), None);
    // "htt" is not a segment boundary match
    assert!(reader.lookup_path_prefix(b"htt").is_empty());

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_json_pv_budget_capping() -> Result<(), Error> {
    init_logging();
    let base = test_dir("json-budget");

    let records = (0..50)
        .map(|i| record(&format!(r#"{{"field{i}":"value{i}"}}"#)))
        .collect();
    let (manager, chunk_id) = sealed_chunk(records);

    let mut config = IndexerConfig::default();
    config.json.budget = 200;
    let indexer = Indexer::new(manager, &base).with_config(config);
    indexer.run(IndexerKind::Json, &chunk_id, &CancellationToken::new())?;

    let reader = JsonIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert!(reader.is_capped());
    // paths are always admitted, pv pairs are budget bounded
    assert_eq!(reader.path_count(), 50);
    assert!(reader.pv_count() < 50);
    assert!(reader.pv_count() * 20 <= 200);

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_json_hard_cap_writes_empty_artifact() -> Result<(), Error> {
    init_logging();
    let base = test_dir("json-cap");

    let records = (0..10)
        .map(|i| record(&format!(r#"{{"field{i}":{i}}}"#)))
        .collect();
    let (manager, chunk_id) = sealed_chunk(records);

    let mut config = IndexerConfig::default();
    config.json.max_unique_paths = 3;
    let indexer = Indexer::new(manager, &base).with_config(config);
    indexer.run(IndexerKind::Json, &chunk_id, &CancellationToken::new())?;

    let reader = JsonIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert!(reader.is_capped());
    assert_eq!(reader.path_count(), 0);
    assert_eq!(reader.pv_count(), 0);

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_kv_budget() -> Result<(), Error> {
    init_logging();
    let base = test_dir("kv-budget");

    let records = (0..100)
        .map(|i| record(&format!("key{i}=value{i}")))
        .collect();
    let (manager, chunk_id) = sealed_chunk(records);

    let mut config = IndexerConfig::default();
    config.kv.budget = 200;
    let indexer = Indexer::new(manager, &base).with_config(config);
    indexer.run(IndexerKind::Kv, &chunk_id, &CancellationToken::new())?;

    let reader = KvIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert!(reader.is_capped());
    assert!(reader.kv_entry_count() > 0);
    assert!(reader.kv_entry_count() < 100);

    // the key index still serves the admitted pairs
    for entry in reader.pair_entries() {
        assert!(
            reader.lookup_key(&entry.key).is_some(),
            "admitted pair without key entry"
        );
        assert_eq!(reader.kv_lookup(&entry.key, &entry.value), Some(&entry.positions[..]));
    }

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_kv_extraction_lowercases() -> Result<(), Error> {
    init_logging();
    let base = test_dir("kv-case");

    let (manager, chunk_id) = sealed_chunk(vec![record("Level=INFO msg=started")]);
    let indexer = Indexer::new(manager, &base);
    indexer.run(IndexerKind::Kv, &chunk_id, &CancellationToken::new())?;

    let reader = KvIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert!(!reader.is_capped());
    assert_eq!(reader.kv_lookup(b"level", b"info"), Some(&[0u32][..]));
    assert_eq!(reader.kv_lookup(b"Level", b"INFO"), None);

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_timestamp_indexes() -> Result<(), Error> {
    init_logging();
    let base = test_dir("tsidx");

    let (manager, chunk_id) = sealed_chunk(vec![
        record("r0").with_ingest_ts(100).with_source_ts(90),
        record("r1").with_ingest_ts(200), // no source timestamp
        record("r2").with_ingest_ts(300).with_source_ts(310),
    ]);
    let indexer = Indexer::new(manager, &base);
    indexer.run(IndexerKind::Timestamp, &chunk_id, &CancellationToken::new())?;

    let ingest = TsidxReader::open_ingest(&indexer.chunk_dir(&chunk_id))?;
    assert_eq!(ingest.len(), 3);
    assert_eq!(ingest.find_start_position(150), (1, true));
    assert_eq!(ingest.find_start_position(300), (2, true));
    assert_eq!(ingest.find_start_position(301), (0, false));

    // records without a source timestamp are skipped
    let source = TsidxReader::open_source(&indexer.chunk_dir(&chunk_id))?;
    assert_eq!(source.len(), 2);
    assert_eq!(source.find_start_position(0), (0, true));
    assert_eq!(source.find_start_position(100), (2, true));

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_source_id_index() -> Result<(), Error> {
    init_logging();
    let base = test_dir("source-id");

    let source_a = SourceId::generate();
    let source_b = SourceId::generate();
    let (manager, chunk_id) = sealed_chunk(vec![
        Record::new("a0", source_a.clone()),
        Record::new("b0", source_b.clone()),
        Record::new("a1", source_a.clone()),
    ]);
    let indexer = Indexer::new(manager, &base);
    indexer.run(IndexerKind::SourceId, &chunk_id, &CancellationToken::new())?;

    let reader = SourceIdIndexReader::open(&indexer.chunk_dir(&chunk_id))?;
    assert_eq!(reader.lookup(&source_a), Some(&[0u32, 2][..]));
    assert_eq!(reader.lookup(&source_b), Some(&[1u32][..]));
    assert_eq!(reader.lookup(&SourceId::generate()), None);

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_builders_refuse_unsealed_chunks() -> Result<(), Error> {
    init_logging();
    let base = test_dir("unsealed");

    let manager = Arc::new(MemoryChunkManager::new(None));
    let chunk_id = manager.append(record("still active"))?.chunk_id;
    let indexer = Indexer::new(manager, &base);

    for kind in IndexerKind::ALL {
        assert!(
            matches!(
                indexer.run(kind, &chunk_id, &CancellationToken::new()),
                Err(StoreError::ChunkNotSealed(_))
            ),
            "{kind:?} must refuse an unsealed chunk"
        );
    }

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_reader_rejects_tampered_artifacts() -> Result<(), Error> {
    init_logging();
    let base = test_dir("tamper");

    let (manager, chunk_id) = sealed_chunk(vec![record("hello world")]);
    let indexer = Indexer::new(manager, &base);
    indexer.run(IndexerKind::Token, &chunk_id, &CancellationToken::new())?;

    let artifact = indexer.chunk_dir(&chunk_id).join("_token.idx");
    let pristine = std::fs::read(&artifact)?;

    // complete flag cleared
    let mut data = pristine.clone();
    data[3] = 0;
    std::fs::write(&artifact, &data)?;
    assert!(matches!(
        TokenIndexReader::open(&indexer.chunk_dir(&chunk_id)),
        Err(StoreError::Incomplete)
    ));

    // wrong magic
    let mut data = pristine.clone();
    data[0] = 0x42;
    std::fs::write(&artifact, &data)?;
    assert!(matches!(
        TokenIndexReader::open(&indexer.chunk_dir(&chunk_id)),
        Err(StoreError::SignatureMismatch)
    ));

    // future version
    let mut data = pristine.clone();
    data[2] = 9;
    std::fs::write(&artifact, &data)?;
    assert!(matches!(
        TokenIndexReader::open(&indexer.chunk_dir(&chunk_id)),
        Err(StoreError::VersionMismatch { .. })
    ));

    // truncated posting blob
    let mut data = pristine.clone();
    data.truncate(data.len() - 1);
    std::fs::write(&artifact, &data)?;
    assert!(matches!(
        TokenIndexReader::open(&indexer.chunk_dir(&chunk_id)),
        Err(StoreError::PostingSizeMismatch)
    ));

    // missing artifact
    std::fs::remove_file(&artifact)?;
    assert!(matches!(
        TokenIndexReader::open(&indexer.chunk_dir(&chunk_id)),
        Err(StoreError::IndexNotFound(_))
    ));

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_indexes_complete_and_delete() -> Result<(), Error> {
    init_logging();
    let base = test_dir("complete");

    let (manager, chunk_id) = sealed_chunk(vec![
        record(r#"{"level":"info"}"#).with_attr("env", "prod"),
    ]);
    let indexer = Indexer::new(manager, &base);

    assert!(!indexer.indexes_complete(&chunk_id)?);

    for kind in IndexerKind::ALL {
        indexer.run(kind, &chunk_id, &CancellationToken::new())?;
    }
    assert!(indexer.indexes_complete(&chunk_id)?);

    // a leftover temp file is swept by the inspection
    let stray = indexer.chunk_dir(&chunk_id).join("_token.idx.tmp");
    std::fs::write(&stray, b"partial")?;
    assert!(indexer.indexes_complete(&chunk_id)?);
    assert!(!stray.exists());

    indexer.delete_indexes(&chunk_id)?;
    assert!(!indexer.indexes_complete(&chunk_id)?);

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_cancellation_leaves_no_artifact() -> Result<(), Error> {
    init_logging();
    let base = test_dir("cancelled");

    let (manager, chunk_id) = sealed_chunk(vec![record("a b c")]);
    let indexer = Indexer::new(manager, &base);

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        indexer.run(IndexerKind::Token, &chunk_id, &cancel),
        Err(StoreError::Cancelled)
    ));
    assert!(!indexer.chunk_dir(&chunk_id).join("_token.idx").exists());

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}
