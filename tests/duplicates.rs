//! Duplicate-key behavior end to end: insertion order, positioned
//! inserts, the migration of a large set to an extended duplicate table,
//! and the pinned semantics of a failed erase after the table relocated.

use settdb::{
    store_error, DatabaseOptions, DupePosition, EnvOptions, Environment, InsertFlags,
    MatchMode, StoreError,
};

fn dup_env() -> (Environment, settdb::Database) {
    let env = Environment::create(EnvOptions::in_memory().page_size(4096)).unwrap();
    let db = env
        .create_database(1, DatabaseOptions::new().enable_duplicates())
        .unwrap();
    (env, db)
}

#[test]
fn duplicates_keep_insertion_order() {
    let (_env, db) = dup_env();

    db.insert(None, b"k", b"first").unwrap();
    for rec in ["second", "third", "fourth"] {
        db.insert_with(None, b"k", rec.as_bytes(), InsertFlags::duplicate())
            .unwrap();
    }

    assert_eq!(db.count(None, b"k").unwrap(), 4);

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", MatchMode::Eq).unwrap();
    let mut records = Vec::new();
    for _ in 0..4 {
        records.push(String::from_utf8(cursor.get_record().unwrap()).unwrap());
        let _ = cursor.move_next();
    }
    assert_eq!(records, vec!["first", "second", "third", "fourth"]);
}

#[test]
fn positioned_duplicate_insert() {
    let (_env, db) = dup_env();

    db.insert(None, b"k", b"b").unwrap();
    db.insert_with(
        None,
        b"k",
        b"a",
        InsertFlags {
            duplicate: true,
            dup_position: Some((DupePosition::First, 0)),
            ..Default::default()
        },
    )
    .unwrap();
    db.insert_with(
        None,
        b"k",
        b"c",
        InsertFlags {
            duplicate: true,
            dup_position: Some((DupePosition::After, 1)),
            ..Default::default()
        },
    )
    .unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", MatchMode::Eq).unwrap();
    let mut records = Vec::new();
    for _ in 0..3 {
        records.push(cursor.get_record().unwrap());
        let _ = cursor.move_next();
    }
    assert_eq!(records, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn two_hundred_duplicates_overflow_to_an_extended_table() {
    // 4096-byte pages tolerate 16 inline duplicates; 200 forces the
    // migration long before the end
    let (_env, db) = dup_env();

    db.insert(None, b"a", b"dup-000").unwrap();
    for i in 1..200u32 {
        let record = format!("dup-{i:03}");
        db.insert_with(None, b"a", record.as_bytes(), InsertFlags::duplicate())
            .unwrap();
    }

    assert_eq!(db.count(None, b"a").unwrap(), 200);

    // duplicate 0 is still the first inserted value
    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"a", MatchMode::Eq).unwrap();
    assert_eq!(cursor.get_record().unwrap(), b"dup-000");
    assert_eq!(cursor.get_record_count().unwrap(), 200);

    // and the set is still fully ordered
    let mut records = Vec::new();
    loop {
        records.push(String::from_utf8(cursor.get_record().unwrap()).unwrap());
        if cursor.move_next().is_err() {
            break;
        }
    }
    assert_eq!(records.len(), 200);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record, &format!("dup-{i:03}"));
    }
}

#[test]
fn erasing_one_duplicate_leaves_the_rest() {
    let (_env, db) = dup_env();

    db.insert(None, b"k", b"v1").unwrap();
    db.insert_with(None, b"k", b"v2", InsertFlags::duplicate())
        .unwrap();

    db.erase_duplicate(None, b"k", 0).unwrap();
    assert_eq!(db.count(None, b"k").unwrap(), 1);
    assert_eq!(db.find(None, b"k").unwrap(), Some(b"v2".to_vec()));

    db.erase(None, b"k").unwrap();
    assert_eq!(db.count(None, b"k").unwrap(), 0);
    assert_eq!(db.find(None, b"k").unwrap(), None);
}

#[test]
fn erase_all_clears_an_extended_table() {
    let (_env, db) = dup_env();

    db.insert(None, b"k", b"r").unwrap();
    for _ in 0..100 {
        db.insert_with(None, b"k", b"r", InsertFlags::duplicate())
            .unwrap();
    }
    assert_eq!(db.count(None, b"k").unwrap(), 101);

    db.erase(None, b"k").unwrap();
    assert_eq!(db.count(None, b"k").unwrap(), 0);
    assert_eq!(db.find(None, b"k").unwrap(), None);
}

#[test]
fn duplicate_table_relocation_then_bad_erase_keeps_state() {
    // push the table through several growth relocations, then issue an
    // erase with an out-of-range duplicate index: the error must surface
    // and the relocated table must stay fully intact
    let (_env, db) = dup_env();

    db.insert(None, b"k", b"dup-000").unwrap();
    for i in 1..150u32 {
        db.insert_with(
            None,
            b"k",
            format!("dup-{i:03}").as_bytes(),
            InsertFlags::duplicate(),
        )
        .unwrap();
    }

    let err = db.erase_duplicate(None, b"k", 150).unwrap_err();
    assert_eq!(store_error(&err), Some(StoreError::KeyNotFound));

    assert_eq!(db.count(None, b"k").unwrap(), 150);
    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", MatchMode::Eq).unwrap();
    assert_eq!(cursor.get_record().unwrap(), b"dup-000");

    // a valid erase afterwards still works
    db.erase_duplicate(None, b"k", 0).unwrap();
    assert_eq!(db.count(None, b"k").unwrap(), 149);
    cursor.find(b"k", MatchMode::Eq).unwrap();
    assert_eq!(cursor.get_record().unwrap(), b"dup-001");
}

#[test]
fn duplicates_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env.db");

    {
        let env = Environment::create(EnvOptions::new(&path).page_size(4096)).unwrap();
        let db = env
            .create_database(1, DatabaseOptions::new().enable_duplicates())
            .unwrap();
        db.insert(None, b"k", b"dup-000").unwrap();
        for i in 1..50u32 {
            db.insert_with(
                None,
                b"k",
                format!("dup-{i:03}").as_bytes(),
                InsertFlags::duplicate(),
            )
            .unwrap();
        }
        drop(db);
        env.close().unwrap();
    }

    let env = Environment::open(EnvOptions::new(&path)).unwrap();
    let db = env.open_database(1).unwrap();
    assert_eq!(db.count(None, b"k").unwrap(), 50);
    assert_eq!(db.find(None, b"k").unwrap(), Some(b"dup-000".to_vec()));
}
