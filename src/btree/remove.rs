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
    split,
};

/// Logical remove: mark the slot as a ghost under an exclusive key
/// lock. The bytes stay on the page until a later ghost reclaim.
pub(crate) fn tree_remove(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
    key: &KeyStr,
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
        if leaf.page().item(slot).ghost {
            return Err(DbError::NotFound);
        }

        let old = leaf.page().item(slot).element().to_vec();
        Logger::log_page(
            db.log_manager(),
            tx,
            &mut leaf,
            LogPayload::BtreeRemove {
                store,
                key: key.clone(),
                old_element: old,
            },
        )?;
        leaf.page_mut().mark_ghost(slot);
        return Ok(());
    }
}

/// Undo of a remove: revive the ghost with the old element. When the
/// ghost was already physically reclaimed, the slot is re-reserved.
pub(crate) fn undo_remove(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
    key: &KeyStr,
    old_element: Vec<u8>,
    undo_nxt: Lsn,
) -> DbResult {
    loop {
        let mut leaf = traverse_to_leaf(db, store, key, LatchMode::Ex)?;
        match leaf.page().search(key) {
            Ok(slot) => {
                if !leaf.page().item(slot).ghost {
                    // an insert got in after the remove being undone;
                    // compensation has nothing left to do
                    return Ok(());
                }
                Logger::log_page_clr(
                    db.log_manager(),
                    tx,
                    &mut leaf,
                    LogPayload::BtreeInsert {
                        store,
                        key: key.clone(),
                        element: old_element.clone(),
                    },
                    undo_nxt,
                )?;
                let slot = leaf.page().search(key).unwrap();
                leaf.page_mut().replace_ghost(slot, old_element);
                return Ok(());
            }
            Err(_) => {
                // reclaimed: reserve the slot again, then revive it
                if !leaf.page().fits(key, old_element.len()) {
                    split::sx_reclaim_ghosts(db, &mut leaf)?;
                    if !leaf.page().fits(key, old_element.len()) {
                        split::sx_split_foster(db, &mut leaf, key)?;
                        continue;
                    }
                }
                Logger::log_page_ssx(
                    db.log_manager(),
                    &mut leaf,
                    LogPayload::BtreeGhostReserve {
                        key: key.clone(),
                        element_len: old_element.len() as u16,
                    },
                )?;
                leaf.page_mut()
                    .insert_leaf_item(key, true, vec![0u8; old_element.len()]);
                Logger::log_page_clr(
                    db.log_manager(),
                    tx,
                    &mut leaf,
                    LogPayload::BtreeInsert {
                        store,
                        key: key.clone(),
                        element: old_element.clone(),
                    },
                    undo_nxt,
                )?;
                let slot = leaf.page().search(key).unwrap();
                leaf.page_mut().replace_ghost(slot, old_element);
                return Ok(());
            }
        }
    }
}
