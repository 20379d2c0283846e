mod common;

use common::{key, open_db_with};
use tempfile::tempdir;
use zero_db::stats::{Stats, STATS};

// A tree larger than the pool, scanned with swizzling on: leaves are
// recycled by the evictioner while the scan and the point reads keep
// working.
#[test]
fn test_eviction_under_swizzling() {
    let dir = tempdir().unwrap();
    let db = open_db_with(&dir, |opts| {
        opts.set_int("sm_bufpoolsize", 1) // 128 frames
            .set_bool("sm_bufferpool_swizzle", true)
            .set_string("sm_evictioner_policy", "clock");
    });
    let tree = db.create_btree().unwrap();

    let evictions_before = Stats::get(&STATS.evictions);
    let tx = db.begin_tx().unwrap();
    // ~190 leaf pages of payload against 128 frames
    for i in 0..3500 {
        tree.insert(&db, &tx, &key(i), &[b'e'; 400]).unwrap();
    }
    tx.commit(&db, false).unwrap();
    assert!(
        Stats::get(&STATS.evictions) > evictions_before,
        "no frame was ever evicted"
    );

    let tx = db.begin_tx().unwrap();
    let all = tree.scan_all(&db, &tx).unwrap();
    assert_eq!(all.len(), 3500);
    for i in (0..3500).step_by(211) {
        assert!(tree.lookup(&db, &tx, &key(i)).unwrap().is_some());
    }
    tx.commit(&db, false).unwrap();
    assert!(tree.verify(&db).unwrap());
    db.shutdown();
}

// Same pressure under each remaining eviction policy.
#[test]
fn test_eviction_policies() {
    for policy in ["random", "loop", "gclock", "car"].iter() {
        let dir = tempdir().unwrap();
        let db = open_db_with(&dir, |opts| {
            opts.set_int("sm_bufpoolsize", 1)
                .set_string("sm_evictioner_policy", policy);
        });
        let tree = db.create_btree().unwrap();
        let tx = db.begin_tx().unwrap();
        for i in 0..2000 {
            tree.insert(&db, &tx, &key(i), &[b'p'; 400]).unwrap();
        }
        tx.commit(&db, false).unwrap();

        let tx = db.begin_tx().unwrap();
        for i in (0..2000).step_by(97) {
            assert!(
                tree.lookup(&db, &tx, &key(i)).unwrap().is_some(),
                "policy {} lost key {}",
                policy,
                i
            );
        }
        tx.commit(&db, false).unwrap();
        db.shutdown();
    }
}

// The cleaner keeps the pool from filling with dirty frames: with a
// pool a fraction of the working set, a large load either succeeds or
// would have died with BfFull.
#[test]
fn test_cleaner_keeps_up() {
    let dir = tempdir().unwrap();
    let db = open_db_with(&dir, |opts| {
        opts.set_int("sm_bufpoolsize", 1)
            .set_int("sm_cleaner_interval", 10)
            .set_string("sm_cleaner_policy", "oldest_lsn");
    });
    let tree = db.create_btree().unwrap();
    let tx = db.begin_tx().unwrap();
    for i in 0..2500 {
        tree.insert(&db, &tx, &key(i), &[b'c'; 400]).unwrap();
    }
    tx.commit(&db, false).unwrap();
    assert!(Stats::get(&STATS.cleaned_pages) > 0, "cleaner never wrote");
    db.shutdown();
}
