//! Durability across close and reopen.

use rdb_core::{Config, CoreError, Database};
use rdb_testkit::prelude::*;
use std::fs;

#[test]
fn contents_survive_reopen() {
    let mut db = TestDatabase::new();
    db.populate(300).unwrap();
    for i in (0..300).step_by(3) {
        assert!(db.remove(&numbered_key(i)).unwrap());
    }

    db.reopen().unwrap();

    assert_eq!(db.len().unwrap(), 200);
    for i in 0..300 {
        let expected = (i % 3 != 0).then(|| numbered_value(i));
        assert_eq!(db.get(&numbered_key(i)).unwrap(), expected, "key {i}");
    }
    assert!(db.verify().unwrap().is_ok());
}

#[test]
fn freed_pages_are_reused_after_reopen() {
    let mut db = TestDatabase::new();
    db.populate(100).unwrap();
    let before = db.info().unwrap();

    for i in 0..50 {
        db.remove(&numbered_key(i)).unwrap();
    }
    db.reopen().unwrap();
    assert!(db.info().unwrap().free_key_pages >= 50);

    for i in 0..50 {
        db.set(&numbered_key(i), &numbered_value(i)).unwrap();
    }
    let after = db.info().unwrap();
    assert_eq!(after.key_file_size, before.key_file_size);
    assert_eq!(after.value_file_size, before.value_file_size);
}

#[test]
fn geometry_comes_from_existing_files() {
    let db = TestDatabase::with_config(small_config().hash_table_size(40));
    db.populate(10).unwrap();
    assert_eq!(db.info().unwrap().hash_table_size, 41);

    db.db.close().unwrap();
    let other = Database::open_with_config(
        db.path(),
        TEST_DB_NAME,
        small_config().hash_table_size(997).key_page_size(256),
    )
    .unwrap();
    let info = other.info().unwrap();
    assert_eq!(info.hash_table_size, 41);
    assert_eq!(info.key_page_size, 64);
    assert_eq!(other.get(&numbered_key(3)).unwrap(), Some(numbered_value(3)));
}

#[test]
fn second_handle_is_locked_out() {
    let db = TestDatabase::new();
    let err = Database::open_with_config(db.path(), TEST_DB_NAME, small_config()).unwrap_err();
    assert!(matches!(err, CoreError::DatabaseLocked), "{err:?}");
}

#[test]
fn damaged_attributes_are_rejected() {
    let mut db = TestDatabase::new();
    db.populate(5).unwrap();
    db.db.close().unwrap();

    let attr = db.path().join(format!("{TEST_DB_NAME}.attr"));
    let mut bytes = fs::read(&attr).unwrap();
    bytes[0] ^= 0xFF;
    fs::write(&attr, bytes).unwrap();

    let err = db.reopen().unwrap_err();
    assert!(matches!(err, CoreError::InvalidFormat { .. }), "{err:?}");
}

#[test]
fn missing_database_without_create_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default().create_if_missing(false);
    assert!(Database::open_with_config(dir.path(), "absent", config).is_err());
    assert!(!dir.path().join("absent.attr").exists());
}
