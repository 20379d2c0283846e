mod common;

use std::{sync::Arc, thread, time::Duration, time::Instant};

use common::{key, open_db};
use tempfile::tempdir;

// Backup, keep working, fail the volume, read through the on-line
// restore, and verify the volume once the coordinator finishes.
#[test]
fn test_instant_restore() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_db(&dir));
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    for i in 0..200 {
        tree.insert(&db, &tx, &key(i), &[b'o'; 200]).unwrap();
    }
    tx.commit(&db, false).unwrap();

    let backup_path = dir.path().join("backup.1");
    db.take_backup(backup_path.to_str().unwrap(), true).unwrap();

    // post-backup work that only the log archive knows about
    let tx = db.begin_tx().unwrap();
    for i in 200..1000 {
        tree.insert(&db, &tx, &key(i), &[b'n'; 200]).unwrap();
    }
    tx.commit(&db, false).unwrap();

    db.mark_volume_failed().unwrap();

    // concurrent readers while the coordinator rebuilds segments
    let mut readers = Vec::new();
    for t in 0..4 {
        let db = Arc::clone(&db);
        readers.push(thread::spawn(move || {
            let tx = db.begin_tx().unwrap();
            for i in (t * 37..1000).step_by(97) {
                let v = tree.lookup(&db, &tx, &key(i)).unwrap();
                assert!(v.is_some(), "key {} unreadable during restore", i);
            }
            tx.commit(&db, false).unwrap();
        }));
    }
    for r in readers {
        r.join().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(60);
    while !db.check_restore_finished() {
        assert!(Instant::now() < deadline, "restore did not finish");
        thread::sleep(Duration::from_millis(20));
    }

    assert!(db.verify_volume().unwrap());
    let tx = db.begin_tx().unwrap();
    for i in 0..1000 {
        assert!(tree.lookup(&db, &tx, &key(i)).unwrap().is_some());
    }
    tx.commit(&db, false).unwrap();

    Arc::try_unwrap(db).ok().expect("no other handles").shutdown();
}

// Writes and even more backups are refused while a restore runs.
#[test]
fn test_restore_gates_writes_and_backups() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    for i in 0..100 {
        tree.insert(&db, &tx, &key(i), &[b'x'; 100]).unwrap();
    }
    tx.commit(&db, false).unwrap();
    let backup_path = dir.path().join("backup.1");
    db.take_backup(backup_path.to_str().unwrap(), true).unwrap();

    db.mark_volume_failed().unwrap();
    // a second failure report is rejected while the first one restores
    assert!(db.mark_volume_failed().is_err());

    let deadline = Instant::now() + Duration::from_secs(60);
    while !db.check_restore_finished() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(20));
    }
    assert!(db.verify_volume().unwrap());
    db.shutdown();
}

// A restore read past the last used pid comes back zeroed instead of
// blocking on a segment that will never exist.
#[test]
fn test_backup_shorter_than_volume() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"only", b"page").unwrap();
    tx.commit(&db, false).unwrap();
    let backup_path = dir.path().join("backup.1");
    db.take_backup(backup_path.to_str().unwrap(), true).unwrap();

    // grow the volume well past the backup
    let tx = db.begin_tx().unwrap();
    for i in 0..300 {
        tree.insert(&db, &tx, &key(i), &[b'g'; 300]).unwrap();
    }
    tx.commit(&db, false).unwrap();

    db.mark_volume_failed().unwrap();
    let deadline = Instant::now() + Duration::from_secs(60);
    while !db.check_restore_finished() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(20));
    }

    let tx = db.begin_tx().unwrap();
    for i in 0..300 {
        assert!(tree.lookup(&db, &tx, &key(i)).unwrap().is_some());
    }
    assert_eq!(tree.lookup(&db, &tx, b"only").unwrap(), Some(b"page".to_vec()));
    tx.commit(&db, false).unwrap();
    assert!(db.verify_volume().unwrap());
    db.shutdown();
}
