mod common;

use grove_db::flags::*;
use grove_db::ErrorKind;

use common::{create_env, db_params, mem_env};

// seed scenario 4: three duplicates, iterated in insertion order
#[test]
fn test_duplicate_insertion_order() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_ENABLE_DUPLICATE_KEYS, &db_params())
        .unwrap();

    db.insert(None, b"k", b"a", 0).unwrap();
    db.insert(None, b"k", b"b", DUPLICATE).unwrap();
    db.insert(None, b"k", b"c", DUPLICATE).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    let (key, record) = cursor.move_cursor(CURSOR_FIRST).unwrap();
    assert_eq!(key, b"k");
    assert_eq!(record, b"a");
    assert_eq!(cursor.get_duplicate_count().unwrap(), 3);
    assert_eq!(cursor.get_duplicate_position().unwrap(), 0);

    let (_, record) = cursor.move_cursor(CURSOR_NEXT).unwrap();
    assert_eq!(record, b"b");
    let (_, record) = cursor.move_cursor(CURSOR_NEXT).unwrap();
    assert_eq!(record, b"c");
    assert_eq!(cursor.get_duplicate_position().unwrap(), 2);

    let err = cursor.move_cursor(CURSOR_NEXT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    cursor.close().unwrap();
}

#[test]
fn test_duplicate_position_flags() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_ENABLE_DUPLICATE_KEYS, &db_params())
        .unwrap();

    db.insert(None, b"k", b"m", 0).unwrap();
    db.insert(None, b"k", b"z", DUPLICATE | DUPLICATE_INSERT_LAST)
        .unwrap();
    db.insert(None, b"k", b"a", DUPLICATE | DUPLICATE_INSERT_FIRST)
        .unwrap();

    let mut cursor = db.cursor(None).unwrap();
    let mut records = Vec::new();
    let (_, r) = cursor.move_cursor(CURSOR_FIRST).unwrap();
    records.push(r);
    while let Ok((_, r)) = cursor.move_cursor(CURSOR_NEXT) {
        records.push(r);
    }
    assert_eq!(records, vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()]);
    cursor.close().unwrap();
}

#[test]
fn test_cursor_relative_duplicate_insert() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_ENABLE_DUPLICATE_KEYS, &db_params())
        .unwrap();

    db.insert(None, b"k", b"one", 0).unwrap();
    db.insert(None, b"k", b"three", DUPLICATE).unwrap();

    // position on "one", insert after it
    let mut cursor = db.cursor(None).unwrap();
    cursor.move_cursor(CURSOR_FIRST).unwrap();
    cursor
        .insert(b"k", b"two", DUPLICATE | DUPLICATE_INSERT_AFTER)
        .unwrap();
    assert_eq!(cursor.get_duplicate_position().unwrap(), 1);

    let mut records = Vec::new();
    cursor.move_cursor(CURSOR_FIRST).map(|(_, r)| records.push(r)).unwrap();
    while let Ok((_, r)) = cursor.move_cursor(CURSOR_NEXT) {
        records.push(r);
    }
    assert_eq!(
        records,
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
    cursor.close().unwrap();
}

#[test]
fn test_skip_duplicates_movement() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_ENABLE_DUPLICATE_KEYS, &db_params())
        .unwrap();

    db.insert(None, b"a", b"1", 0).unwrap();
    db.insert(None, b"a", b"2", DUPLICATE).unwrap();
    db.insert(None, b"b", b"3", 0).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    let (key, _) = cursor.move_cursor(CURSOR_FIRST).unwrap();
    assert_eq!(key, b"a");
    let (key, _) = cursor
        .move_cursor(CURSOR_NEXT | SKIP_DUPLICATES)
        .unwrap();
    assert_eq!(key, b"b");
    cursor.close().unwrap();
}

#[test]
fn test_erase_single_duplicate() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_ENABLE_DUPLICATE_KEYS, &db_params())
        .unwrap();

    db.insert(None, b"k", b"a", 0).unwrap();
    db.insert(None, b"k", b"b", DUPLICATE).unwrap();
    db.insert(None, b"k", b"c", DUPLICATE).unwrap();

    // erase the middle duplicate through a cursor
    let mut cursor = db.cursor(None).unwrap();
    cursor.move_cursor(CURSOR_FIRST).unwrap();
    cursor.move_cursor(CURSOR_NEXT).unwrap();
    cursor.erase(0).unwrap();
    assert!(cursor.is_nil());

    let mut records = Vec::new();
    cursor.move_cursor(CURSOR_FIRST).map(|(_, r)| records.push(r)).unwrap();
    while let Ok((_, r)) = cursor.move_cursor(CURSOR_NEXT) {
        records.push(r);
    }
    assert_eq!(records, vec![b"a".to_vec(), b"c".to_vec()]);
    cursor.close().unwrap();

    // erasing the key drops the remaining duplicates
    db.erase(None, b"k", 0).unwrap();
    assert_eq!(db.count(None, 0).unwrap(), 0);
}

#[test]
fn test_duplicate_count_in_db_count() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_ENABLE_DUPLICATE_KEYS, &db_params())
        .unwrap();

    db.insert(None, b"a", b"1", 0).unwrap();
    db.insert(None, b"a", b"2", DUPLICATE).unwrap();
    db.insert(None, b"a", b"3", DUPLICATE).unwrap();
    db.insert(None, b"b", b"4", 0).unwrap();

    assert_eq!(db.count(None, 0).unwrap(), 4);
    assert_eq!(db.count(None, SKIP_DUPLICATES).unwrap(), 2);
}

#[test]
fn test_duplicates_require_the_db_flag() {
    let env = mem_env();
    let db = env.create_db(1, 0, &db_params()).unwrap();
    db.insert(None, b"k", b"a", 0).unwrap();
    let err = db.insert(None, b"k", b"b", DUPLICATE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);
}

#[test]
fn test_duplicates_with_transactions() {
    let test_env = create_env(
        ENV_ENABLE_TRANSACTIONS,
    );
    let env = &test_env.env;
    let db = env
        .create_db(1, DB_ENABLE_DUPLICATE_KEYS, &db_params())
        .unwrap();

    db.insert(None, b"k", b"committed", 0).unwrap();

    let txn = env.txn_begin(None).unwrap();
    db.insert(Some(&txn), b"k", b"pending", DUPLICATE).unwrap();

    // the merged view shows both, btree entries first
    let mut cursor = db.cursor(Some(&txn)).unwrap();
    cursor.find(b"k", 0).unwrap();
    assert_eq!(cursor.get_duplicate_count().unwrap(), 2);
    let (_, record) = cursor.get_key_and_record().unwrap();
    assert_eq!(record, b"committed");
    let (_, record) = cursor.move_cursor(CURSOR_NEXT).unwrap();
    assert_eq!(record, b"pending");
    cursor.close().unwrap();

    env.txn_commit(&txn).unwrap();
    assert_eq!(db.count(None, 0).unwrap(), 2);
}

#[test]
fn test_cursor_overwrite_keeps_duplicate_index() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_ENABLE_DUPLICATE_KEYS, &db_params())
        .unwrap();

    db.insert(None, b"k", b"a", 0).unwrap();
    db.insert(None, b"k", b"b", DUPLICATE).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.move_cursor(CURSOR_FIRST).unwrap();
    cursor.move_cursor(CURSOR_NEXT).unwrap();
    assert_eq!(cursor.get_duplicate_position().unwrap(), 1);

    cursor.overwrite(b"B").unwrap();
    assert_eq!(cursor.get_duplicate_position().unwrap(), 1);
    let (_, record) = cursor.get_key_and_record().unwrap();
    assert_eq!(record, b"B");

    // the first duplicate is untouched
    let (_, record) = cursor.move_cursor(CURSOR_PREVIOUS).unwrap();
    assert_eq!(record, b"a");
    cursor.close().unwrap();
}
