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

pub(crate) fn tree_insert(
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
        match leaf.page().search(key) {
            Ok(slot) => {
                if !leaf.page().item(slot).ghost {
                    return Err(DbError::Duplicate);
                }
                // a ghost left by a remove: lock the key and revive it
                let id = key_lock_id(store, key);
                let dropped = lock_key(db, tx, &mut leaf, id, OkvlMode::X_N, LatchMode::Ex)?;
                if dropped && !leaf_still_covers(&leaf, key) {
                    continue;
                }
                let slot = match leaf.page().search(key) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if !leaf.page().item(slot).ghost {
                    return Err(DbError::Duplicate);
                }
                let old_len = leaf.page().item(slot).element().len();
                if element.len() > old_len
                    && leaf.page().free_space() < element.len() - old_len
                {
                    split::sx_reclaim_ghosts(db, &mut leaf)?;
                    if leaf.page().search(key).is_err() {
                        // the ghost itself was reclaimed; retry as absent
                        continue;
                    }
                    if leaf.page().free_space() < element.len() - old_len {
                        split::sx_split_foster(db, &mut leaf, key)?;
                        continue;
                    }
                }
                Logger::log_page(
                    db.log_manager(),
                    tx,
                    &mut leaf,
                    LogPayload::BtreeInsert {
                        store,
                        key: key.clone(),
                        element: element.clone(),
                    },
                )?;
                let slot = leaf.page().search(key).unwrap();
                leaf.page_mut().replace_ghost(slot, element);
                return Ok(());
            }
            Err(_) => {
                // make room for the ghost first
                if !leaf.page().fits(key, element.len()) {
                    split::sx_reclaim_ghosts(db, &mut leaf)?;
                    if !leaf.page().fits(key, element.len()) {
                        split::sx_split_foster(db, &mut leaf, key)?;
                        continue;
                    }
                }

                // range locks: the key itself and the gap before its
                // successor (phantom protection for the new key)
                let next_key = match leaf.page().search(key) {
                    Ok(_) => continue,
                    Err(slot) if slot < leaf.page().nrecs() => leaf.page().key_at(slot),
                    Err(_) => leaf.page().fence_high.clone(),
                };
                let id = key_lock_id(store, key);
                let dropped = lock_key(db, tx, &mut leaf, id, OkvlMode::X_N, LatchMode::Ex)?;
                if dropped && !leaf_still_covers(&leaf, key) {
                    continue;
                }
                let gap_id = key_lock_id(store, &next_key);
                let dropped = lock_key(db, tx, &mut leaf, gap_id, OkvlMode::N_X, LatchMode::Ex)?;
                if dropped && !leaf_still_covers(&leaf, key) {
                    continue;
                }
                match leaf.page().search(key) {
                    Ok(_) => continue, // someone slipped in while we waited
                    Err(_) => {}
                }
                if !leaf.page().fits(key, element.len()) {
                    continue;
                }

                // reserve the slot as a ghost, then turn it live
                Logger::log_page_ssx(
                    db.log_manager(),
                    &mut leaf,
                    LogPayload::BtreeGhostReserve {
                        key: key.clone(),
                        element_len: element.len() as u16,
                    },
                )?;
                leaf.page_mut()
                    .insert_leaf_item(key, true, vec![0u8; element.len()]);

                Logger::log_page(
                    db.log_manager(),
                    tx,
                    &mut leaf,
                    LogPayload::BtreeInsert {
                        store,
                        key: key.clone(),
                        element: element.clone(),
                    },
                )?;
                let slot = leaf.page().search(key).unwrap();
                leaf.page_mut().replace_ghost(slot, element);
                return Ok(());
            }
        }
    }
}

/// Undo of an insert: the key reverts to a ghost, compensated by a
/// remove-shaped CLR.
pub(crate) fn undo_insert(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
    key: &KeyStr,
    undo_nxt: Lsn,
) -> DbResult {
    let mut leaf = traverse_to_leaf(db, store, key, LatchMode::Ex)?;
    let slot = match leaf.page().search(key) {
        Ok(s) => s,
        Err(_) => return Ok(()), // already gone (reclaimed)
    };
    if leaf.page().item(slot).ghost {
        return Ok(());
    }
    let old = leaf.page().item(slot).element().to_vec();
    Logger::log_page_clr(
        db.log_manager(),
        tx,
        &mut leaf,
        LogPayload::BtreeRemove {
            store,
            key: key.clone(),
            old_element: old,
        },
        undo_nxt,
    )?;
    leaf.page_mut().mark_ghost(slot);
    Ok(())
}
