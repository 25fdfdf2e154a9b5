mod support;

use std::fs;
use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use mvengine::common::{ObjectIds, COMPACT_FULLY};
use mvengine::engine::{MapName, Session, StorageEngine, TableSpec};
use mvengine::storage::{FileBackend, StoreErrorCode};
use mvengine::tuple::value::Value;
use mvengine::tuple::ValueDataType;
use mvengine::{Database, DatabaseConfig, DbError, Store};
use support::ObservedBackend;
use tempfile::tempdir;

fn add_row(store: &Store, map: &str) -> Result<()> {
    let transaction = store.begin()?;
    let map = transaction.open_map(map, Arc::new(ValueDataType), Arc::new(ValueDataType))?;
    map.put(&[Value::from(1)], &[Value::from("row")])?;
    transaction.commit()?;
    Ok(())
}

#[test]
fn collection_drops_temporary_and_orphaned_maps() -> Result<()> {
    let data_dir = tempdir()?;
    let engine = StorageEngine::new(Arc::new(FileBackend));
    let store = engine.open_store(&Database::new(DatabaseConfig::with_path(
        "gc",
        data_dir.path().join("gc"),
    )))?;

    for map in ["index.9", "temp.1", "table.5", "temp.0", "table.9"] {
        add_row(&store, map)?;
    }
    let live: ObjectIds = [9].into_iter().collect();
    let report = store.remove_temporary_maps(&live)?;
    assert_eq!((report.temporary, report.orphaned), (2, 1));

    let names = store.map_names()?;
    assert!(names.contains(&MapName::Table(9)));
    assert!(names.contains(&MapName::Index(9)));
    assert!(!names.contains(&MapName::Table(5)));
    assert!(!names.iter().any(MapName::is_temporary));
    // system maps are left alone
    assert!(names.iter().any(|name| matches!(name, MapName::Other(_))));

    let report = store.remove_temporary_maps(&live)?;
    assert_eq!((report.temporary, report.orphaned), (0, 0));
    Ok(())
}

#[test]
fn collection_drops_temporary_maps_with_any_suffix() -> Result<()> {
    let engine = StorageEngine::new(Arc::new(FileBackend));
    let store = engine.open_store(&Database::new(DatabaseConfig::in_memory("scratch")))?;
    for map in ["temp.0", "temp.session-7", "table.5"] {
        add_row(&store, map)?;
    }
    let report = store.remove_temporary_maps(&ObjectIds::new())?;
    assert_eq!((report.temporary, report.orphaned), (2, 1));

    let names = store.map_names()?;
    assert!(!names.iter().any(MapName::is_temporary));
    assert!(!names.contains(&MapName::Table(5)));
    Ok(())
}

#[test]
fn collection_rejects_malformed_catalog_map_names() -> Result<()> {
    let engine = StorageEngine::new(Arc::new(FileBackend));
    let store = engine.open_store(&Database::new(DatabaseConfig::in_memory("bad")))?;
    add_row(&store, "table.x")?;
    assert!(matches!(
        store.remove_temporary_maps(&ObjectIds::new()),
        Err(DbError::InvalidMapName { .. })
    ));
    Ok(())
}

#[test]
fn close_fully_compacts_offline() -> Result<()> {
    let data_dir = tempdir()?;
    let backend = Arc::new(ObservedBackend::default());
    let engine = StorageEngine::new(backend.clone());
    let database = Database::new(DatabaseConfig::with_path("full", data_dir.path().join("full")));
    let store = engine.open_store(&database)?;
    let file = store.file_name().expect("file backed");

    for i in 0..20 {
        add_row(&store, &format!("table.{i}"))?;
        store.flush()?;
    }
    let before = fs::metadata(&file)?.len();
    engine.close_store("full", COMPACT_FULLY)?;
    assert_eq!(backend.offline_compactions.load(Ordering::SeqCst), 1);
    assert!(fs::metadata(&file)?.len() < before);

    let store = engine.open_store(&database)?;
    assert_eq!(store.map_names()?.len(), 21);
    engine.close_store("full", Duration::from_millis(10))?;
    assert_eq!(backend.offline_compactions.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn close_tolerates_file_deleted_before_compaction() -> Result<()> {
    let data_dir = tempdir()?;
    let backend = Arc::new(ObservedBackend {
        delete_file_on_close: true,
        ..ObservedBackend::default()
    });
    let engine = StorageEngine::new(backend.clone());
    let store = engine.open_store(&Database::new(DatabaseConfig::with_path(
        "gone",
        data_dir.path().join("gone"),
    )))?;
    add_row(&store, "table.1")?;
    let file = store.file_name().expect("file backed");

    store.close(COMPACT_FULLY)?;
    assert!(!file.exists());
    assert_eq!(backend.offline_compactions.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn failed_close_still_closes() -> Result<()> {
    let data_dir = tempdir()?;
    let engine = StorageEngine::new(Arc::new(ObservedBackend {
        close_failure: Some(StoreErrorCode::WritingFailed),
        ..ObservedBackend::default()
    }));
    let store = engine.open_store(&Database::new(DatabaseConfig::with_path(
        "full-disk",
        data_dir.path().join("full-disk"),
    )))?;

    match store.close(Duration::ZERO) {
        Err(DbError::Io { context, source }) => {
            assert_eq!(context, "Closing");
            assert_eq!(source.code(), StoreErrorCode::WritingFailed);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(store.is_closed());
    Ok(())
}

#[test]
fn open_failures_are_classified() -> Result<()> {
    let data_dir = tempdir()?;
    let cases = [
        (StoreErrorCode::FileLocked, false),
        (StoreErrorCode::FileCorrupt, true),
        (StoreErrorCode::FileCorrupt, false),
        (StoreErrorCode::ReadingFailed, false),
        (StoreErrorCode::WritingFailed, false),
    ];
    for (code, with_key) in cases {
        let engine = StorageEngine::new(Arc::new(ObservedBackend {
            open_failure: Some(code),
            ..ObservedBackend::default()
        }));
        let mut config = DatabaseConfig::with_path("broken", data_dir.path().join("broken"));
        if with_key {
            config = config.encryption_key(vec![1, 2, 3, 4]);
        }
        let err = match engine.open_store(&Database::new(config)) {
            Err(err) => err,
            Ok(_) => panic!("open with {code} succeeded"),
        };
        let expected = match (code, with_key) {
            (StoreErrorCode::FileLocked, _) => matches!(err, DbError::DatabaseAlreadyOpen { .. }),
            (StoreErrorCode::FileCorrupt, true) => matches!(err, DbError::EncryptionKeyMismatch { .. }),
            (StoreErrorCode::ReadingFailed, _) => matches!(err, DbError::Io { .. }),
            _ => matches!(err, DbError::FileCorrupted { .. }),
        };
        assert!(expected, "{code} with key {with_key}: {err:?}");
        assert!(engine.get_store("broken").is_none());
    }
    Ok(())
}

#[test]
fn second_engine_sees_database_in_use() -> Result<()> {
    let data_dir = tempdir()?;
    let config = DatabaseConfig::with_path("busy", data_dir.path().join("busy"));
    let first = StorageEngine::new(Arc::new(FileBackend));
    first.open_store(&Database::new(config.clone()))?;

    let second = StorageEngine::new(Arc::new(FileBackend));
    assert!(matches!(
        second.open_store(&Database::new(config.clone())),
        Err(DbError::DatabaseAlreadyOpen { .. })
    ));

    first.close_store("busy", Duration::ZERO)?;
    second.open_store(&Database::new(config))?;
    Ok(())
}

#[test]
fn wrong_key_is_reported_as_key_mismatch() -> Result<()> {
    let data_dir = tempdir()?;
    let path = data_dir.path().join("secret");
    let engine = StorageEngine::new(Arc::new(FileBackend));
    let config = DatabaseConfig::with_path("secret", &path).encryption_key(b"right key!".to_vec());
    let store = engine.open_store(&Database::new(config))?;
    add_row(&store, "table.1")?;
    engine.close_store("secret", Duration::ZERO)?;

    let wrong = DatabaseConfig::with_path("secret", &path).encryption_key(b"wrong key!".to_vec());
    assert!(matches!(
        engine.open_store(&Database::new(wrong)),
        Err(DbError::EncryptionKeyMismatch { .. })
    ));
    assert!(matches!(
        engine.open_store(&Database::new(DatabaseConfig::with_path("secret", &path))),
        Err(DbError::FileCorrupted { .. })
    ));
    Ok(())
}

#[test]
fn compact_file_shrinks_store_and_backup_reads_it() -> Result<()> {
    let data_dir = tempdir()?;
    let engine = StorageEngine::new(Arc::new(FileBackend));
    let session = Session::new(Database::new(DatabaseConfig::with_path(
        "compact",
        data_dir.path().join("compact"),
    )));
    let table = engine.create_table(&session, TableSpec::new(1, "log"))?;
    let store = engine.open_store(session.database())?;

    for i in 0..50 {
        table.put(&session.transaction(&store)?, &[Value::from(i)], &[Value::from("entry")])?;
        session.commit()?;
        store.flush()?;
    }
    store.sync()?;
    let file = store.file_name().expect("file backed");
    let before = fs::metadata(&file)?.len();

    store.compact_file(Duration::from_secs(5))?;
    let after = fs::metadata(&file)?.len();
    assert!(after < before, "{after} >= {before}");

    let mut backup = Vec::new();
    store.input_stream()?.read_to_end(&mut backup)?;
    assert_eq!(backup.len() as u64, after);
    assert_eq!(&backup[..8], b"MVENGINE");

    let transaction = session.transaction(&store)?;
    assert_eq!(table.get(&transaction, &[Value::from(49)])?, Some(vec![Value::from("entry")]));
    session.rollback()?;
    Ok(())
}

#[test]
fn concurrent_first_access_opens_store_once() -> Result<()> {
    let data_dir = tempdir()?;
    let backend = Arc::new(ObservedBackend::default());
    let engine = StorageEngine::new(backend.clone());
    let database = Database::new(DatabaseConfig::with_path("shared", data_dir.path().join("shared")));
    let barrier = Barrier::new(8);

    let stores: Vec<Arc<Store>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let (engine, database, barrier) = (&engine, &database, &barrier);
                s.spawn(move || {
                    let session = Session::new(Arc::clone(database));
                    barrier.wait();
                    engine
                        .create_table(&session, TableSpec::new(i, format!("t{i}")))
                        .unwrap();
                    engine.get_store("shared").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
    assert!(stores.iter().all(|store| Arc::ptr_eq(store, &stores[0])));
    assert_eq!(stores[0].tables().len(), 8);

    engine.close_store("shared", Duration::ZERO)?;
    assert!(engine.get_store("shared").is_none());
    let reopened = engine.open_store(&database)?;
    assert!(!Arc::ptr_eq(&reopened, &stores[0]));
    assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
    Ok(())
}
