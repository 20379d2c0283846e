mod common;

use common::{key, open_db, open_db_with};
use tempfile::tempdir;

// Crash with one committed and one in-flight transaction: after
// restart the committed writes are there and the loser's are not.
#[test]
fn test_crash_recovery_instant() {
    let dir = tempdir().unwrap();
    let store;
    {
        let db = open_db(&dir);
        let tree = db.create_btree().unwrap();
        store = tree.store;

        let tx = db.begin_tx().unwrap();
        for i in 0..100 {
            tree.insert(&db, &tx, &key(i), b"committed").unwrap();
        }
        tx.commit(&db, false).unwrap();

        let loser = db.begin_tx().unwrap();
        for i in 100..200 {
            tree.insert(&db, &loser, &key(i), b"uncommitted").unwrap();
        }
        // no commit: the process dies here
        db.simulate_crash();
    }

    let db = open_db(&dir);
    let tree = db.open_btree(store).unwrap();
    let tx = db.begin_tx().unwrap();
    for i in 0..100 {
        assert_eq!(
            tree.lookup(&db, &tx, &key(i)).unwrap(),
            Some(b"committed".to_vec()),
            "committed key {} lost",
            i
        );
    }
    for i in 100..200 {
        assert_eq!(
            tree.lookup(&db, &tx, &key(i)).unwrap(),
            None,
            "uncommitted key {} survived",
            i
        );
    }
    tx.commit(&db, false).unwrap();
    assert!(tree.verify(&db).unwrap());
    db.shutdown();
}

// Same crash, recovered with eager log-based redo instead of
// fix-time recovery.
#[test]
fn test_crash_recovery_log_based() {
    let dir = tempdir().unwrap();
    let store;
    {
        let db = open_db(&dir);
        let tree = db.create_btree().unwrap();
        store = tree.store;
        let tx = db.begin_tx().unwrap();
        for i in 0..50 {
            tree.insert(&db, &tx, &key(i), b"v").unwrap();
        }
        tx.commit(&db, false).unwrap();
        db.simulate_crash();
    }

    let db = open_db_with(&dir, |opts| {
        opts.set_bool("sm_restart_instant", false)
            .set_bool("sm_restart_log_based_redo", true);
    });
    let tree = db.open_btree(store).unwrap();
    let tx = db.begin_tx().unwrap();
    for i in 0..50 {
        assert_eq!(tree.lookup(&db, &tx, &key(i)).unwrap(), Some(b"v".to_vec()));
    }
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

// A clean shutdown / reopen cycle keeps everything, twice in a row
// (recovery applied to an already-recovered volume changes nothing).
#[test]
fn test_recovery_idempotent() {
    let dir = tempdir().unwrap();
    let store;
    {
        let db = open_db(&dir);
        let tree = db.create_btree().unwrap();
        store = tree.store;
        let tx = db.begin_tx().unwrap();
        for i in 0..30 {
            tree.insert(&db, &tx, &key(i), b"stable").unwrap();
        }
        tx.commit(&db, false).unwrap();
        db.simulate_crash();
    }
    for _ in 0..2 {
        let db = open_db(&dir);
        let tree = db.open_btree(store).unwrap();
        let tx = db.begin_tx().unwrap();
        for i in 0..30 {
            assert_eq!(
                tree.lookup(&db, &tx, &key(i)).unwrap(),
                Some(b"stable".to_vec())
            );
        }
        tx.commit(&db, false).unwrap();
        db.simulate_crash();
    }
}

// Splits are system transactions: a crash right after a bulk load
// must reconstruct the whole multi-level tree.
#[test]
fn test_crash_recovery_after_splits() {
    let dir = tempdir().unwrap();
    let store;
    {
        let db = open_db(&dir);
        let tree = db.create_btree().unwrap();
        store = tree.store;
        let tx = db.begin_tx().unwrap();
        for i in 0..500 {
            tree.insert(&db, &tx, &key(i), &[b'v'; 400]).unwrap();
        }
        tx.commit(&db, false).unwrap();
        db.simulate_crash();
    }

    let db = open_db(&dir);
    let tree = db.open_btree(store).unwrap();
    assert!(tree.verify(&db).unwrap());
    let tx = db.begin_tx().unwrap();
    let all = tree.scan_all(&db, &tx).unwrap();
    assert_eq!(all.len(), 500);
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_checkpoint_then_recover() {
    let dir = tempdir().unwrap();
    let store;
    {
        let db = open_db(&dir);
        let tree = db.create_btree().unwrap();
        store = tree.store;
        let tx = db.begin_tx().unwrap();
        for i in 0..40 {
            tree.insert(&db, &tx, &key(i), b"v").unwrap();
        }
        tx.commit(&db, false).unwrap();
        db.checkpoint().unwrap();
        let tx = db.begin_tx().unwrap();
        for i in 40..80 {
            tree.insert(&db, &tx, &key(i), b"v").unwrap();
        }
        tx.commit(&db, false).unwrap();
        db.simulate_crash();
    }

    let db = open_db(&dir);
    let tree = db.open_btree(store).unwrap();
    let tx = db.begin_tx().unwrap();
    for i in 0..80 {
        assert_eq!(tree.lookup(&db, &tx, &key(i)).unwrap(), Some(b"v".to_vec()));
    }
    tx.commit(&db, false).unwrap();
    db.shutdown();
}
