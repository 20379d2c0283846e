mod common;

use std::{sync::Arc, sync::Barrier, thread};

use common::open_db;
use tempfile::tempdir;
use zero_db::DbError;

// Two transactions taking the same two keys in opposite orders: the
// dreadlock detector sacrifices exactly one of them.
#[test]
fn test_deadlock_one_victim() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_db(&dir));
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"a", b"v").unwrap();
    tree.insert(&db, &tx, b"b", b"v").unwrap();
    tx.commit(&db, false).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for (first, second) in [(b"a", b"b"), (b"b", b"a")].iter() {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        let (first, second) = (first.to_vec(), second.to_vec());
        handles.push(thread::spawn(move || {
            let tx = db.begin_tx().unwrap();
            tree.update(&db, &tx, &first, b"mine").unwrap();
            barrier.wait();
            let r = tree.update(&db, &tx, &second, b"mine");
            match r {
                Ok(()) => {
                    tx.commit(&db, false).unwrap();
                    false
                }
                Err(DbError::Deadlock) => {
                    tx.abort(&db).unwrap();
                    true
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }));
    }
    let deadlocks: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();
    assert_eq!(deadlocks, 1, "exactly one transaction is the victim");

    // whoever survived (and the aborted one's rollback) left a clean tree
    let tx = db.begin_tx().unwrap();
    assert!(tree.lookup(&db, &tx, b"a").unwrap().is_some());
    assert!(tree.lookup(&db, &tx, b"b").unwrap().is_some());
    tx.commit(&db, false).unwrap();
    Arc::try_unwrap(db).ok().expect("no other handles").shutdown();
}

// Conflicting writers on one key serialize; both commits land.
#[test]
fn test_write_write_conflict_serializes() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_db(&dir));
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"hot", b"0").unwrap();
    tx.commit(&db, false).unwrap();

    let mut handles = Vec::new();
    for t in 0..4u8 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let tx = db.begin_tx().unwrap();
            tree.update(&db, &tx, b"hot", &[b'0' + t]).unwrap();
            tx.commit(&db, false).unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let tx = db.begin_tx().unwrap();
    let v = tree.lookup(&db, &tx, b"hot").unwrap().unwrap();
    assert!(v[0] >= b'0' && v[0] <= b'3');
    tx.commit(&db, false).unwrap();
    Arc::try_unwrap(db).ok().expect("no other handles").shutdown();
}

// Readers of committed data are never blocked out of existence by a
// stream of writers on other keys.
#[test]
fn test_readers_and_writers_mix() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_db(&dir));
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    for i in 0..50 {
        tree.insert(&db, &tx, &common::key(i), b"seed").unwrap();
    }
    tx.commit(&db, false).unwrap();

    let mut handles = Vec::new();
    for w in 0..2u8 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in 0..50 {
                let tx = db.begin_tx().unwrap();
                tree.update(&db, &tx, &common::key(i), &[w; 4]).unwrap();
                tx.commit(&db, true).unwrap();
            }
        }));
    }
    for r in 0..2 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in (r..50).step_by(2) {
                let tx = db.begin_tx().unwrap();
                assert!(tree.lookup(&db, &tx, &common::key(i)).unwrap().is_some());
                tx.commit(&db, true).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    Arc::try_unwrap(db).ok().expect("no other handles").shutdown();
}
