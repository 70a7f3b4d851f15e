mod common;

use std::fs;

use grove_db::flags::*;
use grove_db::{Environment, ErrorKind, Parameters};

use common::{ascii_key, db_params, setup};

const LOG_HEADER_SIZE: u64 = 16;

fn log_path(db_path: &std::path::Path) -> std::path::PathBuf {
    let mut name = db_path.file_name().unwrap().to_os_string();
    name.push(".log0");
    db_path.with_file_name(name)
}

#[test]
fn test_clean_close_truncates_the_log() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clean.db");

    let env = Environment::create(
        &path,
        ENV_ENABLE_TRANSACTIONS | ENV_ENABLE_RECOVERY,
        &Parameters::default(),
    )
    .unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"k", b"v", 0).unwrap();

    // while the environment is open, the log holds the page images
    assert!(fs::metadata(log_path(&path)).unwrap().len() > LOG_HEADER_SIZE);

    env.close().unwrap();
    assert_eq!(
        fs::metadata(log_path(&path)).unwrap().len(),
        LOG_HEADER_SIZE
    );
    drop(env);

    // a clean file reopens without any recovery flags
    let env = Environment::open(&path, 0, &Parameters::default()).unwrap();
    let db = env.open_db(1, &db_params()).unwrap();
    assert_eq!(db.find(None, b"k", 0).unwrap().1, b"v");
}

#[test]
fn test_dirty_log_requires_recovery() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dirty.db");

    let env = Environment::create(
        &path,
        ENV_ENABLE_TRANSACTIONS | ENV_ENABLE_RECOVERY,
        &Parameters::default(),
    )
    .unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"k", b"v", 0).unwrap();

    // simulate the crash: snapshot both files before the clean close
    let crashed = dir.path().join("crashed.db");
    fs::copy(&path, &crashed).unwrap();
    fs::copy(log_path(&path), log_path(&crashed)).unwrap();
    env.close().unwrap();
    drop(env);

    // without auto-recovery the open is refused
    let err = Environment::open(&crashed, 0, &Parameters::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NeedRecovery);
    let err = Environment::open(
        &crashed,
        ENV_ENABLE_RECOVERY,
        &Parameters::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NeedRecovery);
}

// seed scenario 6: commit, crash before the log truncation, reopen with
// auto-recovery
#[test]
fn test_recovery_replays_committed_transactions() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.db");
    let params = Parameters::default();

    let env = Environment::create(
        &path,
        ENV_ENABLE_TRANSACTIONS | ENV_ENABLE_RECOVERY,
        &params,
    )
    .unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();

    let txn = env.txn_begin(None).unwrap();
    for i in 0..5 {
        db.insert(Some(&txn), &ascii_key(i), b"durable", 0).unwrap();
    }
    env.txn_commit(&txn).unwrap();

    // simulate the crash: keep the data file's header page but lose all
    // in-place page writes beyond it; the log must recover them
    let crashed = dir.path().join("crashed.db");
    fs::copy(&path, &crashed).unwrap();
    fs::copy(log_path(&path), log_path(&crashed)).unwrap();
    let file = fs::OpenOptions::new().write(true).open(&crashed).unwrap();
    file.set_len(params.page_size as u64).unwrap();
    drop(file);

    env.close().unwrap();
    drop(env);

    let env = Environment::open(
        &crashed,
        ENV_ENABLE_TRANSACTIONS | ENV_AUTO_RECOVERY,
        &params,
    )
    .unwrap();
    let db = env.open_db(1, &db_params()).unwrap();
    for i in 0..5 {
        let (_, record) = db.find(None, &ascii_key(i), 0).unwrap();
        assert_eq!(record, b"durable");
    }

    // the log shrank back to its header
    assert_eq!(
        fs::metadata(log_path(&crashed)).unwrap().len(),
        LOG_HEADER_SIZE
    );
}

// recovering a file twice produces the same result as recovering it once
#[test]
fn test_recovery_is_idempotent() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idem.db");
    let params = Parameters::default();

    let env = Environment::create(
        &path,
        ENV_ENABLE_TRANSACTIONS | ENV_ENABLE_RECOVERY,
        &params,
    )
    .unwrap();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    for i in 0..20 {
        db.insert(None, &ascii_key(i), b"twice", 0).unwrap();
    }

    let crashed = dir.path().join("crashed.db");
    fs::copy(&path, &crashed).unwrap();
    let saved_log = fs::read(log_path(&path)).unwrap();
    fs::write(log_path(&crashed), &saved_log).unwrap();
    env.close().unwrap();
    drop(env);

    let open_flags = ENV_ENABLE_TRANSACTIONS | ENV_AUTO_RECOVERY;
    let env = Environment::open(&crashed, open_flags, &params).unwrap();
    env.close().unwrap();
    drop(env);
    let first = fs::read(&crashed).unwrap();

    // restore the dirty log and recover again over the recovered file
    fs::write(log_path(&crashed), &saved_log).unwrap();
    let env = Environment::open(&crashed, open_flags, &params).unwrap();
    let db = env.open_db(1, &db_params()).unwrap();
    for i in 0..20 {
        assert_eq!(db.find(None, &ascii_key(i), 0).unwrap().1, b"twice");
    }
    env.close().unwrap();
    drop(env);
    let second = fs::read(&crashed).unwrap();

    assert_eq!(first, second);
}
