use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Error};

use loghive_datastore::error::Error as StoreError;
use loghive_datastore::{
    ChunkManager, FileChunkManager, MemoryChunkManager, Record, RecordCountPolicy, SourceId,
};

fn test_dir(name: &str) -> PathBuf {
    let mut path = std::fs::canonicalize(".").unwrap(); // we need absolute path
    path.push(format!(".testdir-{name}"));
    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
    path
}

fn record(raw: &str) -> Record {
    Record::new(raw, SourceId::generate())
}

#[test]
fn test_rotation_by_count() -> Result<(), Error> {
    let manager = MemoryChunkManager::new(Some(Box::new(RecordCountPolicy::new(3))));

    let refs: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|raw| manager.append(record(raw)))
        .collect::<Result<_, _>>()?;

    assert_eq!(refs[0].chunk_id, refs[1].chunk_id);
    assert_eq!(refs[1].chunk_id, refs[2].chunk_id);
    assert_ne!(refs[2].chunk_id, refs[3].chunk_id);

    assert_eq!(
        refs.iter().map(|r| r.pos).collect::<Vec<_>>(),
        vec![0, 1, 2, 0]
    );

    let list = manager.list()?;
    assert_eq!(list.len(), 2);

    let first = manager.meta(&refs[0].chunk_id)?;
    assert!(first.sealed);
    assert_eq!(first.record_count, 3);

    let second = manager.meta(&refs[3].chunk_id)?;
    assert!(!second.sealed);
    assert_eq!(second.record_count, 1);

    Ok(())
}

#[test]
fn test_cursor_returns_appends_in_order() -> Result<(), Error> {
    let manager = MemoryChunkManager::new(None);

    let raws: Vec<String> = (0..50).map(|i| format!("line {i}")).collect();
    let mut refs = Vec::new();
    for raw in &raws {
        refs.push(manager.append(record(raw))?);
    }
    manager.seal()?;

    let mut cursor = manager.open_cursor(&refs[0].chunk_id)?;
    let mut last_pos = None;
    for (idx, raw) in raws.iter().enumerate() {
        let (rec, rref) = cursor.next()?;
        assert_eq!(rec.raw, raw.as_bytes());
        assert_eq!(rref, refs[idx]);
        if let Some(last) = last_pos {
            assert!(rref.pos > last, "positions must be strictly increasing");
        }
        last_pos = Some(rref.pos);
    }
    assert!(matches!(cursor.next(), Err(StoreError::NoMoreRecords)));

    Ok(())
}

#[test]
fn test_cursor_prev_and_seek() -> Result<(), Error> {
    let manager = MemoryChunkManager::new(None);
    let mut refs = Vec::new();
    for raw in ["one", "two", "three"] {
        refs.push(manager.append(record(raw))?);
    }
    manager.seal()?;

    let mut cursor = manager.open_cursor(&refs[0].chunk_id)?;
    while cursor.next().is_ok() {}

    let (rec, rref) = cursor.prev()?;
    assert_eq!(rec.raw, b"three");
    assert_eq!(rref, refs[2]);

    cursor.seek(&refs[1])?;
    let (rec, _) = cursor.next()?;
    assert_eq!(rec.raw, b"two");

    Ok(())
}

#[test]
fn test_seal_and_active() -> Result<(), Error> {
    let manager = MemoryChunkManager::new(None);

    assert!(manager.active().is_none());
    manager.seal()?; // no-op without an active chunk

    let first = manager.append(record("x"))?;
    assert_eq!(manager.active().unwrap().id, first.chunk_id);

    manager.seal()?;
    assert!(manager.active().is_none());
    assert!(manager.meta(&first.chunk_id)?.sealed);

    // the next append opens a fresh chunk
    let second = manager.append(record("y"))?;
    assert_ne!(first.chunk_id, second.chunk_id);

    Ok(())
}

#[test]
fn test_append_preserved() -> Result<(), Error> {
    let manager = MemoryChunkManager::new(None);

    assert!(matches!(
        manager.append_preserved(record("no ts")),
        Err(StoreError::MissingWriteTs)
    ));

    let mut rec = record("replayed");
    rec.write_ts = 12345;
    let rref = manager.append_preserved(rec)?;

    assert_eq!(manager.read_write_timestamps(&rref.chunk_id, &[rref.pos])?, vec![12345]);

    Ok(())
}

#[test]
fn test_delete_rules() -> Result<(), Error> {
    let manager = MemoryChunkManager::new(None);
    let rref = manager.append(record("x"))?;

    assert!(matches!(
        manager.delete(&rref.chunk_id),
        Err(StoreError::ActiveChunk(_))
    ));

    manager.seal()?;
    manager.delete(&rref.chunk_id)?;

    assert!(matches!(
        manager.meta(&rref.chunk_id),
        Err(StoreError::ChunkNotFound(_))
    ));

    Ok(())
}

#[test]
fn test_find_start_position() -> Result<(), Error> {
    let manager = MemoryChunkManager::new(None);

    let mut chunk_id = None;
    for ts in [100i64, 200, 200, 300] {
        let mut rec = record("x");
        rec.write_ts = ts;
        chunk_id = Some(manager.append_preserved(rec)?.chunk_id);
    }
    let chunk_id = chunk_id.unwrap();

    assert_eq!(manager.find_start_position(&chunk_id, 50)?, None);
    assert_eq!(manager.find_start_position(&chunk_id, 100)?, Some(0));
    assert_eq!(manager.find_start_position(&chunk_id, 250)?, Some(2));
    assert_eq!(manager.find_start_position(&chunk_id, 1000)?, Some(3));

    Ok(())
}

#[test]
fn test_read_write_timestamps_out_of_range() -> Result<(), Error> {
    let manager = MemoryChunkManager::new(None);
    let rref = manager.append(record("x"))?;

    assert!(matches!(
        manager.read_write_timestamps(&rref.chunk_id, &[rref.pos, 999]),
        Err(StoreError::PositionOutOfRange(999))
    ));

    Ok(())
}

#[test]
fn test_file_manager_roundtrip() -> Result<(), Error> {
    let base = test_dir("file-roundtrip");

    let manager = FileChunkManager::open(&base, Some(Box::new(RecordCountPolicy::new(2))))?;

    let r1 = manager
        .append(record("alpha").with_attr("env", "prod").with_source_ts(7))?;
    let r2 = manager.append(record("beta"))?;
    let r3 = manager.append(record("gamma"))?; // rotates

    assert_eq!(r1.chunk_id, r2.chunk_id);
    assert_ne!(r1.chunk_id, r3.chunk_id);
    assert!(r2.pos > r1.pos);

    let mut cursor = manager.open_cursor(&r1.chunk_id)?;
    let (rec, rref) = cursor.next()?;
    assert_eq!(rec.raw, b"alpha");
    assert_eq!(rec.attrs.get("env").map(String::as_str), Some("prod"));
    assert_eq!(rec.source_ts, 7);
    assert_eq!(rref, r1);

    let (rec, rref) = cursor.next()?;
    assert_eq!(rec.raw, b"beta");
    assert_eq!(rref, r2);
    assert!(matches!(cursor.next(), Err(StoreError::NoMoreRecords)));

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_file_manager_reopen() -> Result<(), Error> {
    let base = test_dir("file-reopen");

    let (sealed_id, open_id) = {
        let manager = FileChunkManager::open(&base, None)?;
        let sealed = manager.append(record("persisted"))?;
        manager.seal()?;
        let open = manager.append(record("still active"))?;
        (sealed.chunk_id, open.chunk_id)
    };

    // reopen: sealed chunk intact, the chunk left active by the
    // "crash" above is sealed during recovery
    let manager = FileChunkManager::open(&base, None)?;
    let list = manager.list()?;
    assert_eq!(list.len(), 2);
    assert!(list.iter().all(|meta| meta.sealed));
    assert!(manager.active().is_none());

    let mut cursor = manager.open_cursor(&sealed_id)?;
    let (rec, _) = cursor.next()?;
    assert_eq!(rec.raw, b"persisted");

    let mut cursor = manager.open_cursor(&open_id)?;
    let (rec, _) = cursor.next()?;
    assert_eq!(rec.raw, b"still active");

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_file_manager_delete_removes_directory() -> Result<(), Error> {
    let base = test_dir("file-delete");

    let manager = FileChunkManager::open(&base, None)?;
    let rref = manager.append(record("x"))?;
    manager.seal()?;

    let chunk_dir = base.join(rref.chunk_id.to_string());
    if !chunk_dir.exists() {
        bail!("expected chunk directory {chunk_dir:?}");
    }

    manager.delete(&rref.chunk_id)?;
    assert!(!chunk_dir.exists());
    assert!(matches!(
        manager.meta(&rref.chunk_id),
        Err(StoreError::ChunkNotFound(_))
    ));

    if let Err(_e) = std::fs::remove_dir_all(&base) { /* ignore */ }
    Ok(())
}

#[test]
fn test_concurrent_cursors_over_sealed_chunk() -> Result<(), Error> {
    let manager = Arc::new(MemoryChunkManager::new(None));

    let mut chunk_id = None;
    for i in 0..100 {
        chunk_id = Some(manager.append(record(&format!("r{i}")))?.chunk_id);
    }
    manager.seal()?;
    let chunk_id = chunk_id.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        let chunk_id = chunk_id.clone();
        handles.push(std::thread::spawn(move || -> Result<usize, StoreError> {
            let mut cursor = manager.open_cursor(&chunk_id)?;
            let mut count = 0;
            loop {
                match cursor.next() {
                    Ok(_) => count += 1,
                    Err(StoreError::NoMoreRecords) => return Ok(count),
                    Err(err) => return Err(err),
                }
            }
        }));
    }

    for handle in handles {
        assert_eq!(handle.join().unwrap()?, 100);
    }

    Ok(())
}
