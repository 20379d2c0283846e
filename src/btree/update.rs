use crate::{
    database::Database,
    error::{DbError, DbResult},
    keystr::KeyStr,
    latch::LatchMode,
    lock::{key_lock_id, okvl::BaseMode, okvl::OkvlMode},
    wal::record::LogPayload,
    lsn::Lsn,
    page_id::StoreID,
    transaction::{logger::Logger, Transaction},
};

use super::{
    lookup::{leaf_still_covers, lock_key, traverse_to_leaf},
    page::MAX_ENTRY_SIZE,
    split,
};

/// Replace the element of an existing key. When the new element no
/// longer fits on the page, the update degenerates to remove + insert
/// (ghost-mark, then split and revive through the insert machinery).
pub(crate) fn tree_update(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
    key: &KeyStr,
    element: Vec<u8>,
) -> DbResult {
    if key.len() + element.len() > MAX_ENTRY_SIZE {
        return Err(DbError::RecWontFit);
    }
    db.lock_manager()
        .lil
        .intent_store_lock(tx.tid(), store, BaseMode::IX, tx.timeout)?;

    loop {
        let mut leaf = traverse_to_leaf(db, store, key, LatchMode::Ex)?;
        let slot = match leaf.page().search(key) {
            Ok(s) => s,
            Err(_) => return Err(DbError::NotFound),
        };
        if leaf.page().item(slot).ghost {
            return Err(DbError::NotFound);
        }

        let id = key_lock_id(store, key);
        let dropped = lock_key(db, tx, &mut leaf, id, OkvlMode::X_N, LatchMode::Ex)?;
        if dropped && !leaf_still_covers(&leaf, key) {
            continue;
        }
        let slot = match leaf.page().search(key) {
            Ok(s) => s,
            Err(_) => return Err(DbError::NotFound),
        };
        if leaf.page().item(slot).ghost {
            return Err(DbError::NotFound);
        }

        let old = leaf.page().item(slot).element().to_vec();
        if element.len() > old.len()
            && leaf.page().free_space() < element.len() - old.len()
        {
            split::sx_reclaim_ghosts(db, &mut leaf)?;
            if leaf.page().free_space() < element.len() - old.len() {
                split::sx_split_foster(db, &mut leaf, key)?;
                continue;
            }
        }

        Logger::log_page(
            db.log_manager(),
            tx,
            &mut leaf,
            LogPayload::BtreeUpdate {
                store,
                key: key.clone(),
                old_element: old,
                new_element: element.clone(),
            },
        )?;
        let slot = leaf.page().search(key).unwrap();
        leaf.page_mut().set_element(slot, element);
        return Ok(());
    }
}

/// Overwrite `data.len()` bytes of the element at `offset`.
pub(crate) fn tree_overwrite(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
    key: &KeyStr,
    offset: u16,
    data: Vec<u8>,
) -> DbResult {
    db.lock_manager()
        .lil
        .intent_store_lock(tx.tid(), store, BaseMode::IX, tx.timeout)?;

    loop {
        let mut leaf = traverse_to_leaf(db, store, key, LatchMode::Ex)?;
        let slot = match leaf.page().search(key) {
            Ok(s) => s,
            Err(_) => return Err(DbError::NotFound),
        };
        if leaf.page().item(slot).ghost {
            return Err(DbError::NotFound);
        }

        let id = key_lock_id(store, key);
        let dropped = lock_key(db, tx, &mut leaf, id, OkvlMode::X_N, LatchMode::Ex)?;
        if dropped && !leaf_still_covers(&leaf, key) {
            continue;
        }
        let slot = match leaf.page().search(key) {
            Ok(s) => s,
            Err(_) => return Err(DbError::NotFound),
        };

        let old_full = leaf.page().item(slot).element().to_vec();
        let off = offset as usize;
        if off + data.len() > old_full.len() {
            return Err(DbError::RecWontFit);
        }
        let old_part = old_full[off..off + data.len()].to_vec();

        Logger::log_page(
            db.log_manager(),
            tx,
            &mut leaf,
            LogPayload::BtreeOverwrite {
                store,
                key: key.clone(),
                offset,
                old_part,
                new_part: data.clone(),
            },
        )?;
        let mut element = old_full;
        element[off..off + data.len()].copy_from_slice(&data);
        leaf.page_mut().set_element(slot, element);
        return Ok(());
    }
}

pub(crate) fn undo_update(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
    key: &KeyStr,
    old_element: Vec<u8>,
    new_element: Vec<u8>,
    undo_nxt: Lsn,
) -> DbResult {
    let mut leaf = traverse_to_leaf(db, store, key, LatchMode::Ex)?;
    let slot = match leaf.page().search(key) {
        Ok(s) => s,
        Err(_) => return Ok(()),
    };
    Logger::log_page_clr(
        db.log_manager(),
        tx,
        &mut leaf,
        LogPayload::BtreeUpdate {
            store,
            key: key.clone(),
            old_element: new_element,
            new_element: old_element.clone(),
        },
        undo_nxt,
    )?;
    leaf.page_mut().set_element(slot, old_element);
    Ok(())
}

pub(crate) fn undo_overwrite(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
    key: &KeyStr,
    offset: u16,
    old_part: Vec<u8>,
    new_part: Vec<u8>,
    undo_nxt: Lsn,
) -> DbResult {
    let mut leaf = traverse_to_leaf(db, store, key, LatchMode::Ex)?;
    let slot = match leaf.page().search(key) {
        Ok(s) => s,
        Err(_) => return Ok(()),
    };
    Logger::log_page_clr(
        db.log_manager(),
        tx,
        &mut leaf,
        LogPayload::BtreeOverwrite {
            store,
            key: key.clone(),
            offset,
            old_part: new_part,
            new_part: old_part.clone(),
        },
        undo_nxt,
    )?;
    let mut element = leaf.page().item(slot).element().to_vec();
    let off = offset as usize;
    element[off..off + old_part.len()].copy_from_slice(&old_part);
    leaf.page_mut().set_element(slot, element);
    Ok(())
}
