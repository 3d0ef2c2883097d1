//! Transactions over a file-backed environment: commit ordering, journal
//! rotation under sustained commits, and pending-state visibility.

use settdb::{store_error, DatabaseOptions, EnvOptions, Environment, StoreError};

fn options(path: &std::path::Path) -> EnvOptions {
    EnvOptions::new(path)
        .page_size(4096)
        .enable_transactions()
        .enable_recovery()
}

#[test]
fn committed_transactions_apply_in_issue_order() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(options(&dir.path().join("env.db"))).unwrap();
    let db = env.create_database(1, DatabaseOptions::new()).unwrap();

    let txn = env.begin_txn().unwrap();
    db.insert(Some(&txn), b"k", b"first").unwrap();
    db.erase(Some(&txn), b"k").unwrap();
    db.insert(Some(&txn), b"k", b"second").unwrap();
    txn.commit().unwrap();

    assert_eq!(db.find(None, b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn sequential_transactions_see_prior_commits() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(options(&dir.path().join("env.db"))).unwrap();
    let db = env.create_database(1, DatabaseOptions::new()).unwrap();

    for round in 0..10u32 {
        let txn = env.begin_txn().unwrap();
        let key = format!("round-{round:02}");
        db.insert(Some(&txn), key.as_bytes(), b"done").unwrap();
        if round > 0 {
            let prev = format!("round-{:02}", round - 1);
            assert_eq!(
                db.find(Some(&txn), prev.as_bytes()).unwrap(),
                Some(b"done".to_vec())
            );
        }
        txn.commit().unwrap();
    }

    for round in 0..10u32 {
        let key = format!("round-{round:02}");
        assert!(db.find(None, key.as_bytes()).unwrap().is_some());
    }
}

#[test]
fn sustained_commits_rotate_the_journal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env.db");

    // tiny switch threshold forces several rotations
    let env = Environment::create(options(&path).journal_switch_threshold(16 * 1024)).unwrap();
    let db = env.create_database(1, DatabaseOptions::new()).unwrap();

    for i in 0..200u32 {
        let txn = env.begin_txn().unwrap();
        let key = format!("key-{i:05}");
        db.insert(Some(&txn), key.as_bytes(), &vec![0x42u8; 100])
            .unwrap();
        txn.commit().unwrap();
    }

    // both journal files stayed bounded
    // bounded by the switch threshold plus one commit's worth of records
    let jrn0 = std::fs::metadata(dir.path().join("env.db.jrn0")).unwrap().len();
    let jrn1 = std::fs::metadata(dir.path().join("env.db.jrn1")).unwrap().len();
    assert!(
        jrn0 < 256 * 1024 && jrn1 < 256 * 1024,
        "journal files grew unbounded: {jrn0}, {jrn1}"
    );

    // and nothing was lost across the rotations
    for i in 0..200u32 {
        let key = format!("key-{i:05}");
        assert!(db.find(None, key.as_bytes()).unwrap().is_some(), "lost {key}");
    }

    drop(db);
    env.close().unwrap();

    // clean reopen: rotation never strands a needed record
    let env = Environment::open(options(&path)).unwrap();
    let db = env.open_database(1).unwrap();
    assert_eq!(db.find(None, b"key-00199").unwrap(), Some(vec![0x42u8; 100]));
}

#[test]
fn dropping_a_transaction_aborts_it() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(options(&dir.path().join("env.db"))).unwrap();
    let db = env.create_database(1, DatabaseOptions::new()).unwrap();

    {
        let txn = env.begin_txn().unwrap();
        db.insert(Some(&txn), b"vanishes", b"x").unwrap();
        // dropped without commit
    }

    assert_eq!(db.find(None, b"vanishes").unwrap(), None);

    // the key is writable again: the abort released the conflict claim
    db.insert(None, b"vanishes", b"y").unwrap();
    assert_eq!(db.find(None, b"vanishes").unwrap(), Some(b"y".to_vec()));
}

#[test]
fn conflict_clears_after_abort() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(options(&dir.path().join("env.db"))).unwrap();
    let db = env.create_database(1, DatabaseOptions::new()).unwrap();

    let a = env.begin_txn().unwrap();
    db.insert(Some(&a), b"k", b"a").unwrap();

    let b = env.begin_txn().unwrap();
    let err = db.insert(Some(&b), b"k", b"b").unwrap_err();
    assert_eq!(store_error(&err), Some(StoreError::TxnConflict));

    a.abort().unwrap();
    db.insert(Some(&b), b"k", b"b").unwrap();
    b.commit().unwrap();

    assert_eq!(db.find(None, b"k").unwrap(), Some(b"b".to_vec()));
}

#[test]
fn transactional_duplicates_merge_on_commit() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(options(&dir.path().join("env.db"))).unwrap();
    let db = env
        .create_database(1, DatabaseOptions::new().enable_duplicates())
        .unwrap();

    db.insert(None, b"k", b"committed").unwrap();

    let txn = env.begin_txn().unwrap();
    db.insert_with(Some(&txn), b"k", b"pending", settdb::InsertFlags::duplicate())
        .unwrap();
    assert_eq!(db.count(Some(&txn), b"k").unwrap(), 2);
    txn.commit().unwrap();

    assert_eq!(db.count(None, b"k").unwrap(), 2);
}
