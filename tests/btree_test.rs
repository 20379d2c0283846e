mod common;

use common::{key, open_db};
use tempfile::tempdir;
use zero_db::{btree::page::MAX_ENTRY_SIZE, DbError};

#[test]
fn test_insert_commit_fetch() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"key001", &[b'a'; 100]).unwrap();
    tx.commit(&db, false).unwrap();

    let tx = db.begin_tx().unwrap();
    let found = tree.lookup(&db, &tx, b"key001").unwrap();
    assert_eq!(found, Some(vec![b'a'; 100]));
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_duplicate_insert() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"key001", &[b'a'; 100]).unwrap();
    tx.commit(&db, false).unwrap();

    let tx = db.begin_tx().unwrap();
    let err = tree.insert(&db, &tx, b"key001", &[b'b'; 100]).unwrap_err();
    assert!(matches!(err, DbError::Duplicate));
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_insert_remove_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    for i in 0..20 {
        tree.insert(&db, &tx, &key(i), b"base").unwrap();
    }
    tx.commit(&db, false).unwrap();

    // insert then remove a new pair: same logical state as before
    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"zz-extra", b"v").unwrap();
    tree.remove(&db, &tx, b"zz-extra").unwrap();
    tx.commit(&db, false).unwrap();

    let tx = db.begin_tx().unwrap();
    assert_eq!(tree.lookup(&db, &tx, b"zz-extra").unwrap(), None);
    let all = tree.scan_all(&db, &tx).unwrap();
    assert_eq!(all.len(), 20);
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_put_overwrites() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.put(&db, &tx, b"k", b"v1").unwrap();
    tree.put(&db, &tx, b"k", b"v2").unwrap();
    tx.commit(&db, false).unwrap();

    let tx = db.begin_tx().unwrap();
    assert_eq!(tree.lookup(&db, &tx, b"k").unwrap(), Some(b"v2".to_vec()));
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_update_and_overwrite() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"k", b"hello world").unwrap();
    tree.update(&db, &tx, b"k", b"HELLO world").unwrap();
    tree.overwrite(&db, &tx, b"k", 6, b"WORLD").unwrap();
    tx.commit(&db, false).unwrap();

    let tx = db.begin_tx().unwrap();
    assert_eq!(
        tree.lookup(&db, &tx, b"k").unwrap(),
        Some(b"HELLO WORLD".to_vec())
    );
    // a slice past the element's end does not fit
    let err = tree.overwrite(&db, &tx, b"k", 8, b"xxxx").unwrap_err();
    assert!(matches!(err, DbError::RecWontFit));
    // update of a missing key
    let err = tree.update(&db, &tx, b"missing", b"v").unwrap_err();
    assert!(matches!(err, DbError::NotFound));
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_max_entry_size_boundary() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    let k = b"boundary-key";
    // exactly at the bound
    let fits = vec![0x5au8; MAX_ENTRY_SIZE - k.len()];
    tree.insert(&db, &tx, k, &fits).unwrap();

    // one byte past it
    let too_big = vec![0x5au8; MAX_ENTRY_SIZE - k.len() + 1];
    let err = tree.insert(&db, &tx, b"boundary-ke2", &too_big).unwrap_err();
    assert!(matches!(err, DbError::RecWontFit));
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_savepoint_partial_rollback() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"keep", b"v").unwrap();
    let sp = tx.savepoint();
    tree.insert(&db, &tx, b"drop1", b"v").unwrap();
    tree.insert(&db, &tx, b"drop2", b"v").unwrap();
    tx.rollback_to(&db, sp).unwrap();
    tx.commit(&db, false).unwrap();

    let tx = db.begin_tx().unwrap();
    assert_eq!(tree.lookup(&db, &tx, b"keep").unwrap(), Some(b"v".to_vec()));
    assert_eq!(tree.lookup(&db, &tx, b"drop1").unwrap(), None);
    assert_eq!(tree.lookup(&db, &tx, b"drop2").unwrap(), None);
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_abort_undoes_everything() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"a", b"v1").unwrap();
    tx.commit(&db, false).unwrap();

    let tx = db.begin_tx().unwrap();
    tree.insert(&db, &tx, b"b", b"v2").unwrap();
    tree.update(&db, &tx, b"a", b"changed").unwrap();
    tree.remove(&db, &tx, b"a").unwrap();
    tx.abort(&db).unwrap();

    let tx = db.begin_tx().unwrap();
    assert_eq!(tree.lookup(&db, &tx, b"a").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(tree.lookup(&db, &tx, b"b").unwrap(), None);
    tx.commit(&db, false).unwrap();
    db.shutdown();
}

#[test]
fn test_group_commit() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.create_btree().unwrap();

    // empty group is a no-op
    db.group_commit(&[]).unwrap();

    let t1 = db.begin_tx().unwrap();
    let t2 = db.begin_tx().unwrap();
    tree.insert(&db, &t1, b"g1", b"v").unwrap();
    tree.insert(&db, &t2, b"g2", b"v").unwrap();
    db.group_commit(&[&t1, &t2]).unwrap();

    let tx = db.begin_tx().unwrap();
    assert_eq!(tree.lookup(&db, &tx, b"g1").unwrap(), Some(b"v".to_vec()));
    assert_eq!(tree.lookup(&db, &tx, b"g2").unwrap(), Some(b"v".to_vec()));
    tx.commit(&db, false).unwrap();
    db.shutdown();
}
