use crate::{
    buffer::{FixFlags, PageGuard},
    database::Database,
    error::DbError,
    keystr::KeyStr,
    latch::{LatchMode, Timeout},
    lock::{key_lock_id, okvl::BaseMode, okvl::OkvlMode, LockId},
    page_id::{PageID, StoreID},
    transaction::Transaction,
};

use super::split;

/// Descend from the root to the leaf responsible for `key`, with latch
/// coupling: the child is latched before the parent is released.
/// Interior levels take SH; the leaf takes `leaf_mode`. Foster chains
/// are followed at every level, and a foster child spotted on the way
/// down is opportunistically adopted into its parent.
pub(crate) fn traverse_to_leaf(
    db: &Database,
    store: StoreID,
    key: &KeyStr,
    leaf_mode: LatchMode,
) -> Result<PageGuard, DbError> {
    let bf = db.buffer_pool();
    'restart: loop {
        let mut cur = bf.fix_root(store, LatchMode::Sh)?;
        if cur.page().is_leaf() && leaf_mode == LatchMode::Ex {
            drop(cur);
            cur = bf.fix_root(store, LatchMode::Ex)?;
        }

        loop {
            // right of the high fence: the key lives in the foster chain
            if cur.page().is_above_high_fence(key) {
                let foster = cur.page().foster;
                if foster == 0 {
                    // fences moved underneath a latch dance; start over
                    continue 'restart;
                }
                let emlsn = cur.page().foster_emlsn;
                let mode = if cur.page().is_leaf() {
                    leaf_mode
                } else {
                    LatchMode::Sh
                };
                let mut flags = FixFlags::default();
                flags.emlsn = emlsn;
                let next = bf.fix_nonroot(Some(&mut cur), foster, mode, flags)?;
                cur = next;
                continue;
            }

            if cur.page().is_leaf() {
                return Ok(cur);
            }

            let slot = cur.page().child_slot_for(key);
            let (child_pid, emlsn) = cur.page().child_at(slot);
            let child_is_leaf = cur.page().level == 2;
            let mode = if child_is_leaf { leaf_mode } else { LatchMode::Sh };
            let mut flags = FixFlags::default();
            flags.emlsn = emlsn;
            let child = bf.fix_nonroot(Some(&mut cur), child_pid, mode, flags)?;

            // migrate a pending foster child into the parent while both
            // pages are at hand
            if child.page().foster != 0 {
                let mut child = child;
                if split::try_adopt(db, &mut cur, &mut child)? {
                    // ranges shifted; re-route from the same parent
                    continue;
                }
                cur = child;
                continue;
            }
            cur = child;
        }
    }
}

/// Take a key lock while a leaf is latched. The conditional request is
/// tried first; on conflict the latch is dropped for the blocking wait
/// and re-taken afterwards. Returns whether the latch was dropped (the
/// caller must revalidate the leaf).
pub(crate) fn lock_key(
    db: &Database,
    tx: &Transaction,
    leaf: &mut PageGuard,
    id: LockId,
    mode: OkvlMode,
    relatch_mode: LatchMode,
) -> Result<bool, DbError> {
    match db
        .lock_manager()
        .acquire(tx.tid(), id, mode, Timeout::Immediate)
    {
        Ok(()) => {
            tx.record_lock(id);
            Ok(false)
        }
        Err(DbError::CondLockTimeout) => {
            let r = leaf.unlatch_during(relatch_mode, || {
                db.lock_manager().acquire(tx.tid(), id, mode, tx.timeout)
            });
            match r {
                Ok(()) => {
                    tx.record_lock(id);
                    Ok(true)
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// The leaf may have split or shrunk while its latch was dropped.
pub(crate) fn leaf_still_covers(leaf: &PageGuard, key: &KeyStr) -> bool {
    leaf.page().is_leaf() && leaf.page().is_in_fences(key)
}

pub(crate) fn tree_lookup(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
    key: &KeyStr,
) -> Result<Option<Vec<u8>>, DbError> {
    db.lock_manager()
        .lil
        .intent_store_lock(tx.tid(), store, BaseMode::IS, tx.timeout)?;

    loop {
        let mut leaf = traverse_to_leaf(db, store, key, LatchMode::Sh)?;
        let id = key_lock_id(store, key);
        let dropped = lock_key(db, tx, &mut leaf, id, OkvlMode::S_N, LatchMode::Sh)?;
        if dropped && !leaf_still_covers(&leaf, key) {
            continue;
        }
        return Ok(match leaf.page().search(key) {
            Ok(slot) if !leaf.page().item(slot).ghost => {
                Some(leaf.page().item(slot).element().to_vec())
            }
            _ => None,
        });
    }
}

/// In-order scan: pid0 and item children first, then the page's foster
/// chain (an unadopted foster child is reachable only through the
/// chain, never through the parent as well).
pub(crate) fn tree_scan_all(
    db: &Database,
    tx: &Transaction,
    store: StoreID,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
    db.lock_manager()
        .lil
        .intent_store_lock(tx.tid(), store, BaseMode::IS, tx.timeout)?;
    let mut out = Vec::new();
    let root = db.buffer_pool().fix_root(store, LatchMode::Sh)?;
    scan_page(db, root, &mut out)?;
    Ok(out)
}

fn scan_page(
    db: &Database,
    mut guard: PageGuard,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<(), DbError> {
    let bf = db.buffer_pool();

    if guard.page().is_leaf() {
        for i in 0..guard.page().nrecs() {
            let item = guard.page().item(i);
            if !item.ghost {
                out.push((
                    guard.page().key_at(i).as_bytes().to_vec(),
                    item.element().to_vec(),
                ));
            }
        }
    } else {
        let children: Vec<PageID> = std::iter::once(guard.page().pid0)
            .chain((0..guard.page().nrecs()).map(|i| guard.page().item(i).child()))
            .collect();
        for child in children {
            let child_guard =
                bf.fix_nonroot(Some(&mut guard), child, LatchMode::Sh, FixFlags::default())?;
            scan_page(db, child_guard, out)?;
        }
    }

    let foster = guard.page().foster;
    if foster != 0 {
        let chain = bf.fix_nonroot(Some(&mut guard), foster, LatchMode::Sh, FixFlags::default())?;
        drop(guard);
        scan_page(db, chain, out)?;
    }
    Ok(())
}
