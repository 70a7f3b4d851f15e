mod common;

use grove_db::flags::*;
use grove_db::ErrorKind;

use common::{ascii_key, create_env, db_params, mem_env};

#[test]
fn test_nil_cursor_errors() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();

    let cursor = db.cursor(None).unwrap();
    let err = cursor.get_key_and_record().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CursorIsNil);
    let err = cursor.get_duplicate_position().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CursorIsNil);
}

#[test]
fn test_move_on_empty_database() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    let err = cursor.move_cursor(CURSOR_FIRST).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    let err = cursor.move_cursor(CURSOR_LAST).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    cursor.close().unwrap();
}

#[test]
fn test_cursor_find_and_walk() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    for i in 0..100 {
        db.insert(None, &ascii_key(i), &ascii_key(i), 0).unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(&ascii_key(50), 0).unwrap();
    let (key, record) = cursor.get_key_and_record().unwrap();
    assert_eq!(key, ascii_key(50));
    assert_eq!(record, ascii_key(50));

    let (key, _) = cursor.move_cursor(CURSOR_NEXT).unwrap();
    assert_eq!(key, ascii_key(51));
    let (key, _) = cursor.move_cursor(CURSOR_PREVIOUS).unwrap();
    assert_eq!(key, ascii_key(50));
    cursor.close().unwrap();
}

#[test]
fn test_cursor_insert_couples_to_the_new_key() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.insert(b"hello", b"world", 0).unwrap();
    let (key, record) = cursor.get_key_and_record().unwrap();
    assert_eq!(key, b"hello");
    assert_eq!(record, b"world");
    assert_eq!(cursor.get_record_size().unwrap(), 5);
    cursor.close().unwrap();
}

#[test]
fn test_cursor_overwrite() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"k", b"old", 0).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", 0).unwrap();
    cursor.overwrite(b"new value").unwrap();

    // the cursor stays on the key and sees the new record
    let (_, record) = cursor.get_key_and_record().unwrap();
    assert_eq!(record, b"new value");
    cursor.close().unwrap();

    assert_eq!(db.find(None, b"k", 0).unwrap().1, b"new value");
}

#[test]
fn test_cursor_erase_nils_the_cursor() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"a", b"1", 0).unwrap();
    db.insert(None, b"b", b"2", 0).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"a", 0).unwrap();
    cursor.erase(0).unwrap();
    assert!(cursor.is_nil());

    let err = db.find(None, b"a", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    assert_eq!(db.count(None, 0).unwrap(), 1);
    cursor.close().unwrap();
}

#[test]
fn test_two_cursors_one_erases() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"target", b"v", 0).unwrap();
    db.insert(None, b"other", b"w", 0).unwrap();

    let mut observer = db.cursor(None).unwrap();
    observer.find(b"target", 0).unwrap();

    // the erase through the database nils the observing cursor as well
    db.erase(None, b"target", 0).unwrap();
    assert!(observer.is_nil());
    observer.close().unwrap();
}

#[test]
fn test_clone_cursor() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    for i in 0..10 {
        db.insert(None, &ascii_key(i), b"r", 0).unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(&ascii_key(5), 0).unwrap();

    let mut copy = cursor.clone_cursor().unwrap();
    // the clone moves independently
    let (key, _) = copy.move_cursor(CURSOR_NEXT).unwrap();
    assert_eq!(key, ascii_key(6));
    let (key, _) = cursor.get_key_and_record().map(|(k, r)| (k, r)).unwrap();
    assert_eq!(key, ascii_key(5));

    cursor.close().unwrap();
    copy.close().unwrap();
}

#[test]
fn test_clone_holds_the_transaction_refcount() {
    let test_env = create_env(ENV_ENABLE_TRANSACTIONS);
    let env = &test_env.env;
    let db = env.create_db(1, 0, &db_params()).unwrap();

    let txn = env.txn_begin(None).unwrap();
    let cursor = db.cursor(Some(&txn)).unwrap();
    let mut copy = cursor.clone_cursor().unwrap();
    drop(cursor);

    // the clone still blocks the commit
    let err = env.txn_commit(&txn).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CursorStillOpen);
    copy.close().unwrap();
    env.txn_commit(&txn).unwrap();
}

#[test]
fn test_cursor_survives_page_splits() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, &ascii_key(0), b"first", 0).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(&ascii_key(0), 0).unwrap();

    // enough inserts to split the leaf the cursor is standing on
    for i in 1..2000 {
        db.insert(None, &ascii_key(i), b"r", 0).unwrap();
    }

    // the cursor was uncoupled during the splits but still knows its key
    let (key, record) = cursor.get_key_and_record().unwrap();
    assert_eq!(key, ascii_key(0));
    assert_eq!(record, b"first");

    let (key, _) = cursor.move_cursor(CURSOR_NEXT).unwrap();
    assert_eq!(key, ascii_key(1));
    cursor.close().unwrap();
}

#[test]
fn test_cursor_approx_find_merges_layers() {
    let test_env = create_env(ENV_ENABLE_TRANSACTIONS);
    let env = &test_env.env;
    let db = env.create_db(1, 0, &db_params()).unwrap();

    db.insert(None, b"20", b"btree", 0).unwrap();
    db.insert(None, b"40", b"btree", 0).unwrap();

    let txn = env.txn_begin(None).unwrap();
    db.insert(Some(&txn), b"30", b"txn", 0).unwrap();

    let mut cursor = db.cursor(Some(&txn)).unwrap();

    // the pending key is the closest lower neighbor of "35"
    cursor.find(b"35", FIND_LEQ_MATCH).unwrap();
    let (key, record) = cursor.get_key_and_record().unwrap();
    assert_eq!(key, b"30");
    assert_eq!(record, b"txn");

    // and the closest greater neighbor of "25"
    cursor.find(b"25", FIND_GEQ_MATCH).unwrap();
    let (key, _) = cursor.get_key_and_record().unwrap();
    assert_eq!(key, b"30");

    // exact finds prefer the exact key
    cursor.find(b"40", FIND_LEQ_MATCH).unwrap();
    let (key, record) = cursor.get_key_and_record().unwrap();
    assert_eq!(key, b"40");
    assert_eq!(record, b"btree");

    cursor.close().unwrap();
    env.txn_abort(&txn).unwrap();
}

#[test]
fn test_record_size_of_blob_records() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"k", &vec![5u8; 12345], 0).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", 0).unwrap();
    assert_eq!(cursor.get_record_size().unwrap(), 12345);
    cursor.close().unwrap();
}
