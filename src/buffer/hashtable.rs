use dashmap::DashMap;

use crate::page_id::{FrameIdx, PageID};

/// Hash table entry: where the page is, and which frame holds its
/// parent (the parent-pointer sidemap used for EMLSN maintenance and
/// unswizzling; 0 = unknown/none).
#[derive(Copy, Clone, Debug)]
pub struct HashEntry {
    pub frame: FrameIdx,
    pub parent: FrameIdx,
}

/// Concurrent PageID -> frame map. Lookups are lock-free reads; inserts
/// race through `try_insert` so double-misses resolve to one winner.
pub struct PageTable {
    map: DashMap<PageID, HashEntry>,
}

impl PageTable {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn lookup(&self, pid: PageID) -> Option<HashEntry> {
        self.map.get(&pid).map(|e| *e)
    }

    /// Returns false when another thread installed the pid first.
    pub fn try_insert(&self, pid: PageID, entry: HashEntry) -> bool {
        match self.map.entry(pid) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(entry);
                true
            }
        }
    }

    pub fn remove(&self, pid: PageID) {
        self.map.remove(&pid);
    }

    pub fn set_parent(&self, pid: PageID, parent: FrameIdx) {
        if let Some(mut e) = self.map.get_mut(&pid) {
            e.parent = parent;
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
