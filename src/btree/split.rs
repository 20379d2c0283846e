use log::debug;

use crate::{
    buffer::PageGuard,
    database::Database,
    error::{DbError, DbResult},
    keystr::KeyStr,
    wal::record::{LogPayload, MovedBody, MovedItem},
    lsn::Lsn,
    page::PAGE_SIZE,
    transaction::logger::Logger,
};

use super::page::{BTreePage, ItemBody, BT_CHAIN_HIGH_SUPREMUM, BT_HIGH_SUPREMUM};

/// Foster split of an EX-latched page. A root page grows instead (its
/// content moves to a fresh child, the root becomes interior). For any
/// other page: allocate a foster child with a no-record split, then
/// rebalance the upper half across unless the insert is purely
/// right-skewed. The caller re-traverses afterwards.
pub(crate) fn sx_split_foster(db: &Database, page: &mut PageGuard, key_hint: &KeyStr) -> DbResult {
    if page.page().is_root() {
        return sx_grow_root(db, page);
    }
    let bf = db.buffer_pool();
    let log = db.log_manager();

    // structural surgery works on disk pids only
    bf.deswizzle_page_children(page.page_mut());

    let (split_key, right_skew) = {
        let p = page.page();
        let n = p.nrecs();
        if n == 0 {
            return Err(DbError::RecWontFit);
        }
        let last = p.key_at(n - 1);
        if *key_hint > last {
            (key_hint.clone(), true)
        } else {
            (p.key_at(n / 2), false)
        }
    };
    if split_key <= page.page().fence_low || page.page().is_above_high_fence(&split_key) {
        return Err(DbError::Corrupt(format!(
            "split key {:?} outside fences",
            split_key
        )));
    }

    let store = page.page().hdr.store;
    let new_pid = db.volume().alloc_a_page(store)?;
    let mut new_guard = bf.fix_virgin(new_pid)?;

    // the chain high fence is shared by every page of the chain
    let (chain_fence_high, chain_supremum) = {
        let p = page.page();
        if p.foster != 0 {
            (
                p.chain_fence_high.clone(),
                p.btflags & BT_CHAIN_HIGH_SUPREMUM != 0,
            )
        } else {
            (p.fence_high.clone(), p.btflags & BT_HIGH_SUPREMUM != 0)
        }
    };

    let payload = LogPayload::BtreeNorecSplit {
        store,
        root: page.page().root,
        level: page.page().level,
        new_pid,
        split_key: split_key.clone(),
        fence_high: page.page().fence_high.clone(),
        btflags_new: page.page().btflags & BT_HIGH_SUPREMUM,
        chain_fence_high,
        chain_supremum,
        foster: page.page().foster,
        foster_emlsn: page.page().foster_emlsn,
    };
    let (_, rec) = Logger::log_page2_ssx(log, page, &mut new_guard, payload)?;
    let old_pid = page.pid();
    rec.redo(old_pid, page.page_mut());
    rec.redo(new_pid, new_guard.page_mut());
    debug!(
        "foster split: page {} -> {} at {:?} (right_skew: {})",
        old_pid, new_pid, split_key, right_skew
    );

    if !right_skew {
        let moved: Vec<MovedItem> = {
            let p = page.page();
            (0..p.nrecs())
                .filter(|i| p.key_at(*i) >= split_key)
                .map(|i| {
                    let item = p.item(i);
                    MovedItem {
                        key: p.key_at(i),
                        ghost: item.ghost,
                        body: match &item.body {
                            ItemBody::Leaf { element } => MovedBody::Leaf(element.clone()),
                            ItemBody::Interior { child, emlsn } => {
                                MovedBody::Interior(*child, *emlsn)
                            }
                        },
                    }
                })
                .collect()
        };
        let payload = LogPayload::BtreeFosterRebalance {
            split_key: split_key.clone(),
            moved,
        };
        let (_, rec) = Logger::log_page2_ssx(log, page, &mut new_guard, payload)?;
        rec.redo(old_pid, page.page_mut());
        rec.redo(new_pid, new_guard.page_mut());
    }
    Ok(())
}

/// Root growth: the root's whole content moves into a freshly allocated
/// page, and the root is reformatted one level up with that page as its
/// single (pid0) child. Both new images are logged as SSXs so recovery
/// rebuilds either page from scratch.
pub(crate) fn sx_grow_root(db: &Database, root: &mut PageGuard) -> DbResult {
    let bf = db.buffer_pool();
    let log = db.log_manager();

    bf.deswizzle_page_children(root.page_mut());

    let store = root.page().hdr.store;
    let root_pid = root.pid();
    let new_pid = db.volume().alloc_a_page(store)?;
    let mut new_guard = bf.fix_virgin(new_pid)?;

    {
        let moved = root.page().clone();
        let newp = new_guard.page_mut();
        *newp = moved;
        newp.hdr.pid = new_pid;
        newp.hdr.lsn = Lsn::NULL;
    }
    {
        let old_level = root.page().level;
        let rp = root.page_mut();
        *rp = BTreePage::format(
            root_pid,
            store,
            root_pid,
            old_level + 1,
            KeyStr::empty(),
            KeyStr::empty(),
            BT_HIGH_SUPREMUM | BT_CHAIN_HIGH_SUPREMUM,
            KeyStr::empty(),
        );
        rp.pid0 = new_pid;
    }

    // log full images: new child first, then the grown root
    let child_img = new_guard.page().to_image().to_vec();
    let child_lsn = Logger::log_page_ssx(log, &mut new_guard, LogPayload::PageImgFormat {
        image: child_img,
    })?;
    root.page_mut().pid0_emlsn = child_lsn;

    let root_img = root.page().to_image().to_vec();
    Logger::log_page_ssx(log, root, LogPayload::PageImgFormat { image: root_img })?;

    bf.note_parent_change(new_pid, root.idx());
    debug!(
        "root {} grew to level {}, content now in page {}",
        root_pid,
        root.page().level,
        new_pid
    );
    Ok(())
}

/// Adopt `child`'s foster child into `parent`: one multi-page SSX that
/// installs the separator in the parent and clears the child's foster
/// pointer. Returns true when an adoption happened (routing changed).
/// Both guards may arrive SH; the upgrades are conditional, and any
/// contention simply skips the adoption.
pub(crate) fn try_adopt(
    db: &Database,
    parent: &mut PageGuard,
    child: &mut PageGuard,
) -> Result<bool, DbError> {
    use crate::latch::LatchMode;

    if parent.mode() != LatchMode::Ex && parent.try_upgrade().is_err() {
        return Ok(false);
    }
    if child.mode() != LatchMode::Ex && child.try_upgrade().is_err() {
        return Ok(false);
    }
    // revalidate after the upgrades
    if child.page().foster == 0 || parent.page().is_leaf() {
        return Ok(false);
    }

    let bf = db.buffer_pool();
    bf.deswizzle_page_children(child.page_mut());

    let separator = child.page().fence_high.clone();
    let new_child = child.page().foster;
    let new_child_emlsn = child.page().foster_emlsn;

    if !parent.page().is_in_fences(&separator) || parent.page().search(&separator).is_ok() {
        return Ok(false);
    }
    // a full parent splits first; the adoption retries on a later pass
    let need = 2 + separator.len() + 12;
    if parent.page().free_space() < need + PAGE_SIZE / 16 {
        sx_split_foster(db, parent, &separator)?;
        return Ok(true);
    }

    let payload = LogPayload::BtreeFosterAdopt {
        separator,
        new_child,
        new_child_emlsn,
    };
    let (_, rec) = Logger::log_page2_ssx(db.log_manager(), parent, child, payload)?;
    let parent_pid = parent.pid();
    let child_pid = child.pid();
    rec.redo(parent_pid, parent.page_mut());
    rec.redo(child_pid, child.page_mut());
    bf.note_parent_change(new_child, parent.idx());
    debug!(
        "adopted page {} from {} into {}",
        new_child, child_pid, parent_pid
    );
    Ok(true)
}

/// De-adoption: push a parent's separator back down as a foster pointer
/// of the left sibling (the inverse of adoption, used to shrink a
/// parent before structural maintenance).
/// Locate the lowest interior parent routing `key`, then de-adopt the
/// separator at the routed slot into its left sibling. `NotFound` when
/// the key routes through pid0 (there is no left sibling to take the
/// foster pointer).
pub(crate) fn tree_deadopt(db: &Database, store: crate::page_id::StoreID, key: &KeyStr) -> DbResult {
    use crate::buffer::FixFlags;
    use crate::latch::LatchMode;

    let bf = db.buffer_pool();
    let mut parent = bf.fix_root(store, LatchMode::Ex)?;
    if parent.page().is_leaf() {
        return Err(DbError::NotFound);
    }
    while parent.page().level > 2 {
        let slot = parent.page().child_slot_for(key);
        let (child_pid, emlsn) = parent.page().child_at(slot);
        let mut flags = FixFlags::default();
        flags.emlsn = emlsn;
        let child = bf.fix_nonroot(Some(&mut parent), child_pid, LatchMode::Ex, flags)?;
        parent = child;
    }
    bf.deswizzle_page_children(parent.page_mut());

    let slot = parent.page().child_slot_for(key);
    let slot_idx = match slot {
        super::page::ChildSlot::Pid0 => return Err(DbError::NotFound),
        super::page::ChildSlot::Slot(i) => i,
    };
    let separator = parent.page().key_at(slot_idx);
    let left_ref = if slot_idx == 0 {
        super::page::ChildSlot::Pid0
    } else {
        super::page::ChildSlot::Slot(slot_idx - 1)
    };
    let (left_pid, left_emlsn) = parent.page().child_at(left_ref);
    let mut flags = FixFlags::default();
    flags.emlsn = left_emlsn;
    let mut left = bf.fix_nonroot(Some(&mut parent), left_pid, LatchMode::Ex, flags)?;
    sx_deadopt_foster(db, &mut parent, &mut left, &separator)
}

pub(crate) fn sx_deadopt_foster(
    db: &Database,
    parent: &mut PageGuard,
    left: &mut PageGuard,
    separator: &KeyStr,
) -> DbResult {
    db.buffer_pool().deswizzle_page_children(parent.page_mut());
    let slot = match parent.page().search(separator) {
        Ok(s) => s,
        Err(_) => return Err(DbError::NotFound),
    };
    let child_pid = parent.page().item(slot).child();
    let child_emlsn = parent.page().item(slot).emlsn();
    if left.page().foster != 0 {
        return Err(DbError::LatchInUse);
    }
    let payload = LogPayload::BtreeFosterDeadopt {
        separator: separator.clone(),
        child_pid,
        child_emlsn,
    };
    let (_, rec) = Logger::log_page2_ssx(db.log_manager(), parent, left, payload)?;
    let parent_pid = parent.pid();
    let left_pid = left.pid();
    rec.redo(parent_pid, parent.page_mut());
    rec.redo(left_pid, left.page_mut());
    db.buffer_pool().note_parent_change(child_pid, left.idx());
    Ok(())
}

/// Drop every ghost on the page in one SSX; called when an insert needs
/// room before it resorts to a split.
pub(crate) fn sx_reclaim_ghosts(db: &Database, leaf: &mut PageGuard) -> DbResult {
    let keys: Vec<KeyStr> = {
        let p = leaf.page();
        (0..p.nrecs())
            .filter(|i| p.item(*i).ghost)
            .map(|i| p.key_at(i))
            .collect()
    };
    if keys.is_empty() {
        return Ok(());
    }
    Logger::log_page_ssx(
        db.log_manager(),
        leaf,
        LogPayload::BtreeGhostReclaim { keys },
    )?;
    leaf.page_mut().reclaim_ghosts();
    Ok(())
}
