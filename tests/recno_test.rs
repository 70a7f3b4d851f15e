mod common;

use grove_db::flags::*;
use grove_db::ErrorKind;

use common::{db_params, mem_env};

#[test]
fn test_record_numbers_are_assigned_monotonically() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_RECORD_NUMBER32, &db_params())
        .unwrap();

    let mut previous = Vec::new();
    for i in 0..100u32 {
        let key = db.insert(None, b"", &i.to_le_bytes(), 0).unwrap();
        assert_eq!(key.len(), 4);
        // strictly ascending, bytewise and numerically
        assert!(key > previous);
        previous = key;
    }
    assert_eq!(previous, 100u32.to_be_bytes());
    assert_eq!(db.get_recno(), 100);
}

#[test]
fn test_recno64_keys_are_eight_bytes() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_RECORD_NUMBER64, &db_params())
        .unwrap();

    let key = db.insert(None, b"", b"r", 0).unwrap();
    assert_eq!(key, 1u64.to_be_bytes());

    let (_, record) = db.find(None, &key, 0).unwrap();
    assert_eq!(record, b"r");
}

#[test]
fn test_iteration_is_in_numeric_order() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_RECORD_NUMBER32, &db_params())
        .unwrap();

    for i in 0..300u32 {
        db.insert(None, b"", &i.to_le_bytes(), 0).unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    let (key, _) = cursor.move_cursor(CURSOR_FIRST).unwrap();
    assert_eq!(key, 1u32.to_be_bytes());
    let mut last = key;
    let mut count = 1;
    while let Ok((key, _)) = cursor.move_cursor(CURSOR_NEXT) {
        assert!(key > last);
        last = key;
        count += 1;
    }
    assert_eq!(count, 300);
    assert_eq!(last, 300u32.to_be_bytes());
    cursor.close().unwrap();
}

// seed scenario 5: a pre-seeded counter at the maximum wraps into
// LimitsReached
#[test]
fn test_counter_exhaustion() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_RECORD_NUMBER32, &db_params())
        .unwrap();

    // seed the counter by inserting the maximum key explicitly
    let max_key = u32::MAX.to_be_bytes();
    db.insert(None, &max_key, b"last", 0).unwrap();
    assert_eq!(db.get_recno(), u32::MAX as u64);

    let err = db.insert(None, b"", b"next", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitsReached);
}

#[test]
fn test_explicit_keys_must_match_the_width() {
    let env = mem_env();
    let db = env
        .create_db(1, DB_RECORD_NUMBER32, &db_params())
        .unwrap();

    let err = db.insert(None, b"abc", b"r", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvKeySize);
}

#[test]
fn test_record_number_dbs_reject_duplicates() {
    let env = mem_env();
    let err = env
        .create_db(
            1,
            DB_RECORD_NUMBER32 | DB_ENABLE_DUPLICATE_KEYS,
            &db_params(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvParameter);
}
