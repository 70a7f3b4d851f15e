mod common;

use grove_db::flags::*;
use grove_db::{Environment, ErrorKind, KeyType, Parameters};

use common::{ascii_key, create_env, create_env_with, db_params, mem_env, setup};

#[test]
fn test_create_close_reopen_roundtrip() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.db");

    let env =
        Environment::create(&path, 0, &Parameters::default()).unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    for i in 0..100 {
        db.insert(None, &ascii_key(i), b"persisted", 0).unwrap();
    }
    env.close().unwrap();
    drop(db);
    drop(env);

    let env = Environment::open(&path, 0, &Parameters::default()).unwrap();
    let db = env.open_db(1, &db_params()).unwrap();
    assert_eq!(db.count(None, 0).unwrap(), 100);
    for i in (0..100).step_by(7) {
        assert_eq!(
            db.find(None, &ascii_key(i), 0).unwrap().1,
            b"persisted"
        );
    }
    db.check_integrity().unwrap();
}

#[test]
fn test_open_missing_file() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let err = Environment::open(
        dir.path().join("nope.db"),
        0,
        &Parameters::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
}

#[test]
fn test_open_garbage_file() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.db");
    std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

    let err =
        Environment::open(&path, 0, &Parameters::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvFileHeader);
}

#[test]
fn test_second_open_would_block() {
    let test_env = create_env(0);
    let err = Environment::open(
        test_env.path(),
        0,
        &Parameters::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
}

#[test]
fn test_read_only_rejects_writes() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.db");

    let env =
        Environment::create(&path, 0, &Parameters::default()).unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"k", b"v", 0).unwrap();
    env.close().unwrap();
    drop(db);
    drop(env);

    let env =
        Environment::open(&path, ENV_READ_ONLY, &Parameters::default())
            .unwrap();
    let db = env.open_db(1, &db_params()).unwrap();
    assert_eq!(db.find(None, b"k", 0).unwrap().1, b"v");

    let err = db.insert(None, b"new", b"x", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteProtected);
    let err = db.erase(None, b"k", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteProtected);
}

#[test]
fn test_in_memory_environment() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    for i in 0..1000 {
        db.insert(None, &ascii_key(i), b"volatile", 0).unwrap();
    }
    assert_eq!(db.count(None, 0).unwrap(), 1000);
    db.check_integrity().unwrap();

    // in-memory environments reject recovery
    setup();
    let err = Environment::create(
        "x",
        ENV_IN_MEMORY | ENV_ENABLE_RECOVERY,
        &Parameters::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);
}

#[test]
fn test_invalid_parameters() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    let mut params = Parameters::default();
    params.page_size = 1000; // not a power of two
    let err = Environment::create(dir.path().join("a.db"), 0, &params)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);

    let mut params = Parameters::default();
    params.max_databases = 0;
    let err = Environment::create(dir.path().join("b.db"), 0, &params)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);
}

#[test]
fn test_database_name_validation() {
    let env = mem_env();
    let err = env.create_db(0, 0, &db_params()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);
    let err = env.create_db(0xf500, 0, &db_params()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);

    env.create_db(7, 0, &db_params()).unwrap();
    let err = env.create_db(7, 0, &db_params()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);
}

#[test]
fn test_compression_is_rejected() {
    let env = mem_env();
    let mut params = db_params();
    params.key_compression = 1;
    let err = env.create_db(1, 0, &params).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);
}

#[test]
fn test_rename_db() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rename.db");

    let env =
        Environment::create(&path, 0, &Parameters::default()).unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"k", b"v", 0).unwrap();

    // open databases cannot be renamed
    let err = env.rename_db(1, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);
    env.close_db(1).unwrap();
    drop(db);

    env.rename_db(1, 2).unwrap();
    let err = env.open_db(1, &db_params()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    let db = env.open_db(2, &db_params()).unwrap();
    assert_eq!(db.find(None, b"k", 0).unwrap().1, b"v");
}

#[test]
fn test_erase_db_frees_its_pages() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("erase.db");

    let env =
        Environment::create(&path, 0, &Parameters::default()).unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    for i in 0..2000 {
        db.insert(None, &ascii_key(i), &vec![7u8; 100], 0).unwrap();
    }
    env.close_db(1).unwrap();
    drop(db);

    env.erase_db(1).unwrap();
    let err = env.open_db(1, &db_params()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);

    // the second database reuses the freed pages instead of growing the
    // file substantially
    let db = env.create_db(2, 0, &db_params()).unwrap();
    for i in 0..100 {
        db.insert(None, &ascii_key(i), b"x", 0).unwrap();
    }
    assert_eq!(db.count(None, 0).unwrap(), 100);
}

#[test]
fn test_reclaim_shrinks_the_file_on_close() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reclaim.db");

    let env =
        Environment::create(&path, 0, &Parameters::default()).unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    // inline records, so the tree itself carries all the pages
    for i in 0..5000 {
        db.insert(None, &ascii_key(i), b"tiny", 0).unwrap();
    }
    for i in 0..5000 {
        db.erase(None, &ascii_key(i), 0).unwrap();
    }
    let before = std::fs::metadata(&path).unwrap().len();
    env.close().unwrap();
    drop(db);
    drop(env);

    // most of the tree's pages were merged away and reclaimed
    let shrunk = std::fs::metadata(&path).unwrap().len();
    assert!(shrunk < before, "file did not shrink: {} -> {}", before, shrunk);
}

#[test]
fn test_tiny_cache_evicts_and_refetches() {
    let mut params = Parameters::default();
    // four pages worth of cache forces constant eviction
    params.cache_size = 4 * params.page_size as u64;
    let test_env = create_env_with(0, params);
    let env = &test_env.env;
    let db = env.create_db(1, 0, &db_params()).unwrap();

    for i in 0..5000 {
        db.insert(None, &ascii_key(i), b"evicted", 0).unwrap();
    }
    for i in (0..5000).step_by(111) {
        assert_eq!(db.find(None, &ascii_key(i), 0).unwrap().1, b"evicted");
    }
    assert_eq!(db.count(None, 0).unwrap(), 5000);
    db.check_integrity().unwrap();
}

#[test]
fn test_crc32_checked_environment() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crc.db");
    let flags = ENV_ENABLE_CRC32;

    let env =
        Environment::create(&path, flags, &Parameters::default()).unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    for i in 0..100 {
        db.insert(None, &ascii_key(i), b"checked", 0).unwrap();
    }
    env.close().unwrap();
    drop(db);
    drop(env);

    let env =
        Environment::open(&path, flags, &Parameters::default()).unwrap();
    let db = env.open_db(1, &db_params()).unwrap();
    assert_eq!(db.find(None, &ascii_key(42), 0).unwrap().1, b"checked");
}

#[test]
fn test_metrics_snapshot() {
    let test_env = create_env_with(0, Parameters::default());
    let env = &test_env.env;
    let db = env.create_db(1, 0, &db_params()).unwrap();

    for i in 0..50 {
        db.insert(None, &ascii_key(i), &vec![9u8; 500], 0).unwrap();
    }
    for i in 0..50 {
        db.find(None, &ascii_key(i), 0).unwrap();
    }

    let metrics = env.get_metrics();
    assert!(metrics.blobs_allocated >= 50);
    assert!(metrics.cache_hits > 0);
}

#[test]
fn test_key_types_persist_across_reopen() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("types.db");

    let env =
        Environment::create(&path, 0, &Parameters::default()).unwrap();
    let mut params = db_params();
    params.key_type = KeyType::UInt32;
    let db = env.create_db(1, 0, &params).unwrap();
    db.insert(None, &77u32.to_le_bytes(), b"typed", 0).unwrap();
    env.close().unwrap();
    drop(db);
    drop(env);

    let env = Environment::open(&path, 0, &Parameters::default()).unwrap();
    let db = env.open_db(1, &db_params()).unwrap();
    assert_eq!(db.get_key_type(), KeyType::UInt32);
    assert_eq!(
        db.find(None, &77u32.to_le_bytes(), 0).unwrap().1,
        b"typed"
    );

    // the fixed key width is enforced after the reopen as well
    let err = db.insert(None, b"xyz", b"v", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvKeySize);
}
