//! Rebuild preserves contents while compacting and reshaping the files.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdb_core::CoreError;
use rdb_testkit::prelude::*;
use std::fs;

fn sorted_contents(db: &TestDatabase) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut entries = db.scan().unwrap();
    entries.sort();
    entries
}

#[test]
fn rebuild_after_random_churn_matches_model() {
    const INSERTS: usize = 12_000;

    let mut db = TestDatabase::new();
    let mut oracle = Oracle::new();
    let mut rng = StdRng::seed_from_u64(42);
    let mut live: Vec<Vec<u8>> = Vec::new();

    for n in 0..INSERTS {
        let key = format!("k{n:06}").into_bytes();
        let len = rng.gen_range(0..200);
        let op = Op::Set(key.clone(), (0..len).map(|_| rng.gen()).collect());
        oracle.apply(&db, &op).unwrap().unwrap();
        live.push(key);

        let op = match rng.gen_range(0..10) {
            0..=3 => Op::Remove(live.swap_remove(rng.gen_range(0..live.len()))),
            4 => {
                let key = live[rng.gen_range(0..live.len())].clone();
                let len = rng.gen_range(0..200);
                Op::Set(key, (0..len).map(|_| rng.gen()).collect())
            }
            5 => Op::Get(live[rng.gen_range(0..live.len())].clone()),
            _ => continue,
        };
        oracle.apply(&db, &op).unwrap().unwrap();
    }
    assert_eq!(live.len(), oracle.len());
    assert!(oracle.len() > INSERTS / 2);

    let contents = sorted_contents(&db);
    let mut expected: Vec<_> = oracle
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    expected.sort();
    assert_eq!(contents, expected);

    let before = db.info().unwrap();
    db.set_hash_table_size(1000).unwrap();
    db.set_value_page_size(128).unwrap();
    let stats = db.rebuild().unwrap();

    assert_eq!(stats.keys, oracle.len() as u64);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.recovered, 0);
    assert_eq!(stats.old_hash_table_size, 101);
    assert_eq!(stats.hash_table_size, 1009);
    assert_eq!(stats.value_page_size, 128);
    assert!(stats.key_file_after <= stats.key_file_before);

    let after = db.info().unwrap();
    assert_eq!(after.hash_table_size, 1009);
    assert_eq!(after.value_page_size, 128);
    assert!(after.free_key_pages <= before.free_key_pages);
    assert_eq!(sorted_contents(&db), contents);
    oracle.check(&db).unwrap().unwrap();
    assert!(db.verify().unwrap().is_ok());

    db.reopen().unwrap();
    assert_eq!(db.info().unwrap().hash_table_size, 1009);
    assert_eq!(sorted_contents(&db), contents);
}

#[test]
fn rebuild_leaves_no_staged_files() {
    let db = TestDatabase::new();
    db.populate(50).unwrap();
    db.rebuild().unwrap();

    for entry in fs::read_dir(db.path()).unwrap() {
        let name = entry.unwrap().file_name().into_string().unwrap();
        assert!(
            !name.ends_with(".new") && !name.ends_with(".bak"),
            "leftover {name}"
        );
    }
}

#[test]
fn rebuild_is_repeatable() {
    let db = TestDatabase::new();
    db.populate(200).unwrap();

    let first = db.rebuild().unwrap();
    let second = db.rebuild().unwrap();
    assert_eq!(first.keys, 200);
    assert_eq!(second.keys, 200);
    assert_eq!(second.key_file_before, second.key_file_after);
    assert_eq!(second.value_file_before, second.value_file_after);
    assert_eq!(db.stats().rebuilds, 2);
}

#[test]
fn rebuild_refuses_key_pages_too_small_for_existing_keys() {
    let db = TestDatabase::with_config(small_config().key_page_size(128));
    let long_key = vec![b'x'; 60];
    db.set(&long_key, b"v").unwrap();

    db.set_key_page_size(64).unwrap();
    let err = db.rebuild().unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument { .. }), "{err:?}");

    // The original files are still in service.
    assert_eq!(db.get(&long_key).unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.info().unwrap().key_page_size, 128);
}

#[test]
fn interrupted_rebuild_is_rolled_back_on_open() {
    let mut db = TestDatabase::new();
    db.populate(30).unwrap();
    db.db.close().unwrap();

    // A crash after staging left a half-written replacement key file.
    let staged = db.path().join(format!("{TEST_DB_NAME}.idx.new"));
    fs::write(&staged, b"partial").unwrap();

    db.reopen().unwrap();
    assert!(!staged.exists());
    assert_eq!(db.len().unwrap(), 30);
    assert!(db.verify().unwrap().is_ok());
}
