mod insert;
mod lookup;
pub mod page;
mod remove;
mod split;
mod update;
mod verify;

use log::debug;

use crate::{
    database::Database,
    error::{DbError, DbResult},
    keystr::KeyStr,
    wal::record::{LogPayload, LogRecord},
    page_id::{PageID, StoreID},
    transaction::Transaction,
};

/// Handle to one Foster B-tree store. All operations run inside the
/// caller's transaction and fix pages through the engine's buffer pool.
#[derive(Copy, Clone, Debug)]
pub struct BTree {
    pub store: StoreID,
    pub root_pid: PageID,
}

impl BTree {
    pub fn new(store: StoreID, root_pid: PageID) -> Self {
        Self { store, root_pid }
    }

    /// Insert a new key; `Duplicate` when a live entry already exists.
    pub fn insert(&self, db: &Database, tx: &Transaction, key: &[u8], element: &[u8]) -> DbResult {
        insert::tree_insert(db, tx, self.store, &KeyStr::new(key), element.to_vec())
    }

    /// Logical delete: the slot becomes a ghost, reclaimed lazily.
    pub fn remove(&self, db: &Database, tx: &Transaction, key: &[u8]) -> DbResult {
        remove::tree_remove(db, tx, self.store, &KeyStr::new(key))
    }

    pub fn lookup(
        &self,
        db: &Database,
        tx: &Transaction,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, DbError> {
        lookup::tree_lookup(db, tx, self.store, &KeyStr::new(key))
    }

    /// Replace the element of an existing key.
    pub fn update(&self, db: &Database, tx: &Transaction, key: &[u8], element: &[u8]) -> DbResult {
        update::tree_update(db, tx, self.store, &KeyStr::new(key), element.to_vec())
    }

    /// Overwrite a slice of the element in place.
    pub fn overwrite(
        &self,
        db: &Database,
        tx: &Transaction,
        key: &[u8],
        offset: u16,
        data: &[u8],
    ) -> DbResult {
        update::tree_overwrite(db, tx, self.store, &KeyStr::new(key), offset, data.to_vec())
    }

    /// Insert-or-update.
    pub fn put(&self, db: &Database, tx: &Transaction, key: &[u8], element: &[u8]) -> DbResult {
        let key = KeyStr::new(key);
        match update::tree_update(db, tx, self.store, &key, element.to_vec()) {
            Err(DbError::NotFound) => {
                insert::tree_insert(db, tx, self.store, &key, element.to_vec())
            }
            r => r,
        }
    }

    /// All live (key, element) pairs in key order.
    pub fn scan_all(
        &self,
        db: &Database,
        tx: &Transaction,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        lookup::tree_scan_all(db, tx, self.store)
    }

    /// Maintenance inverse of adoption: push the separator routing `key`
    /// back down as a foster pointer of its left sibling.
    pub fn deadopt_foster(&self, db: &Database, key: &[u8]) -> DbResult {
        split::tree_deadopt(db, self.store, &KeyStr::new(key))
    }

    /// Structural verification: fences, levels, foster chains, ordering.
    pub fn verify(&self, db: &Database) -> Result<bool, DbError> {
        verify::verify_tree(db, self.store)
    }
}

/// Logical undo of one record, called while rolling back a transaction
/// (live abort, savepoint rollback, or restart of a loser). Re-locates
/// the key by traversal, applies the inverse and writes a CLR.
pub(crate) fn undo_record(db: &Database, tx: &Transaction, rec: &LogRecord) -> DbResult {
    debug!("undo {:?} of tx {}", rec.kind(), rec.tid);
    match &rec.payload {
        LogPayload::BtreeInsert { store, key, .. } => {
            insert::undo_insert(db, tx, *store, key, rec.prev_lsn)
        }
        LogPayload::BtreeRemove {
            store,
            key,
            old_element,
        } => remove::undo_remove(db, tx, *store, key, old_element.clone(), rec.prev_lsn),
        LogPayload::BtreeUpdate {
            store,
            key,
            old_element,
            new_element,
        } => update::undo_update(
            db,
            tx,
            *store,
            key,
            old_element.clone(),
            new_element.clone(),
            rec.prev_lsn,
        ),
        LogPayload::BtreeOverwrite {
            store,
            key,
            offset,
            old_part,
            new_part,
        } => update::undo_overwrite(
            db,
            tx,
            *store,
            key,
            *offset,
            old_part.clone(),
            new_part.clone(),
            rec.prev_lsn,
        ),
        // system and SSX records never participate in undo
        _ => Ok(()),
    }
}
