use log::warn;

use crate::{
    buffer::{FixFlags, PageGuard},
    database::Database,
    error::DbError,
    keystr::KeyStr,
    latch::LatchMode,
    page_id::StoreID,
};

use super::page::BT_HIGH_SUPREMUM;

/// Expected key range of a subtree: `[low, high)`, where `high` may be
/// the supremum.
#[derive(Clone)]
struct Range {
    low: KeyStr,
    high: KeyStr,
    high_is_sup: bool,
}

/// Walk the whole tree checking that every page sits inside the fences
/// its parent expects, that foster chains are same-level and rightward,
/// and that keys are ordered and inside their page's fences. Logs every
/// violation and returns whether the tree is consistent.
pub(crate) fn verify_tree(db: &Database, store: StoreID) -> Result<bool, DbError> {
    let root = db.buffer_pool().fix_root(store, LatchMode::Sh)?;
    let mut issues = 0usize;
    let range = Range {
        low: KeyStr::empty(),
        high: KeyStr::empty(),
        high_is_sup: true,
    };
    let expected_level = root.page().level;
    check_chain(db, root, &range, expected_level, &mut issues)?;
    Ok(issues == 0)
}

/// Verify a page and its foster chain against the range the parent
/// delegates to it, then recurse into children.
fn check_chain(
    db: &Database,
    first: PageGuard,
    range: &Range,
    expected_level: u16,
    issues: &mut usize,
) -> Result<(), DbError> {
    let bf = db.buffer_pool();
    let mut expected_low = range.low.clone();
    let mut guard = first;
    let mut hops = 0usize;

    loop {
        let page = guard.page();
        if page.level != expected_level {
            warn!(
                "page {}: level {} where {} was expected",
                guard.pid(),
                page.level,
                expected_level
            );
            *issues += 1;
        }
        if page.fence_low != expected_low {
            warn!(
                "page {}: low fence {:?} does not meet {:?}",
                guard.pid(),
                page.fence_low,
                expected_low
            );
            *issues += 1;
        }
        let page_high_sup = page.btflags & BT_HIGH_SUPREMUM != 0;

        // keys ordered and inside the fences
        let mut prev: Option<KeyStr> = None;
        for i in 0..page.nrecs() {
            let key = page.key_at(i);
            if let Some(p) = &prev {
                if *p >= key {
                    warn!("page {}: keys out of order at slot {}", guard.pid(), i);
                    *issues += 1;
                }
            }
            if key < page.fence_low || (!page_high_sup && key >= page.fence_high) {
                warn!("page {}: key {:?} outside fences", guard.pid(), key);
                *issues += 1;
            }
            prev = Some(key);
        }

        // recurse into children of an interior page
        if !page.is_leaf() {
            let child_level = page.level - 1;
            let nrecs = page.nrecs();
            let pid0 = page.pid0;
            let seps: Vec<KeyStr> = (0..nrecs).map(|i| page.key_at(i)).collect();
            let children: Vec<u32> = (0..nrecs).map(|i| page.item(i).child()).collect();
            let high = page.fence_high.clone();
            let mut g = guard;

            for i in 0..=nrecs {
                let (child, low) = if i == 0 {
                    (pid0, g.page().fence_low.clone())
                } else {
                    (children[i - 1], seps[i - 1].clone())
                };
                let (child_high, child_high_sup) = if i == nrecs {
                    (high.clone(), page_high_sup)
                } else {
                    (seps[i].clone(), false)
                };
                if child == 0 {
                    warn!("page {}: null child pointer at {}", g.pid(), i);
                    *issues += 1;
                    continue;
                }
                let child_guard =
                    bf.fix_nonroot(Some(&mut g), child, LatchMode::Sh, FixFlags::default())?;
                let child_range = Range {
                    low,
                    high: child_high,
                    high_is_sup: child_high_sup,
                };
                check_chain(db, child_guard, &child_range, child_level, issues)?;
            }
            guard = g;
        }

        // advance along the foster chain
        let page = guard.page();
        let foster = page.foster;
        if foster == 0 {
            // the chain must close exactly on the delegated high fence
            let high_matches = if range.high_is_sup {
                page.btflags & BT_HIGH_SUPREMUM != 0
            } else {
                page.fence_high == range.high
            };
            if !high_matches {
                warn!(
                    "page {}: chain ends at {:?}, expected {:?}",
                    guard.pid(),
                    page.fence_high,
                    range.high
                );
                *issues += 1;
            }
            return Ok(());
        }

        hops += 1;
        if hops > 1024 {
            warn!("foster chain from page {} does not terminate", guard.pid());
            *issues += 1;
            return Ok(());
        }
        if page.btflags & BT_HIGH_SUPREMUM != 0 {
            warn!(
                "page {}: foster pointer on an unbounded page",
                guard.pid()
            );
            *issues += 1;
        }
        expected_low = page.fence_high.clone();
        let mut g = guard;
        let next = bf.fix_nonroot(Some(&mut g), foster, LatchMode::Sh, FixFlags::default())?;
        drop(g);
        guard = next;
    }
}
