use std::io::Cursor;

use crate::{
    error::DbError,
    io::{DbWriter, Decodeable, Encodeable},
    keystr::KeyStr,
    lsn::Lsn,
    page::{
        new_page_image, seal_image, PageHeader, PageImage, PageTag, PAGE_HEADER_SIZE, PAGE_SIZE,
    },
    page_id::{is_swizzled, PageID, StoreID},
};

/// Upper bound on key + element size; one byte past this is rejected with
/// `RecWontFit` before the page is even consulted.
pub const MAX_ENTRY_SIZE: usize = 4000;

/// fence_high is the supremum (rightmost page of the tree or chain).
pub const BT_HIGH_SUPREMUM: u16 = 0x1;
/// chain_fence_high is the supremum.
pub const BT_CHAIN_HIGH_SUPREMUM: u16 = 0x2;

// root(4) pid0(4) pid0_emlsn(8) foster(4) foster_emlsn(8) level(2)
// btflags(2) nrecs(2)
const BT_FIXED: usize = 34;

#[derive(Clone, Debug)]
pub enum ItemBody {
    Leaf { element: Vec<u8> },
    Interior { child: PageID, emlsn: Lsn },
}

#[derive(Clone, Debug)]
pub struct BTreeItem {
    /// Key with the page prefix stripped.
    pub key_suffix: Vec<u8>,
    pub ghost: bool,
    pub body: ItemBody,
}

impl BTreeItem {
    fn disk_size(&self) -> usize {
        match &self.body {
            // ghost(1) + suffix(2+n) + element(2+n)
            ItemBody::Leaf { element } => 1 + 2 + self.key_suffix.len() + 2 + element.len(),
            // suffix(2+n) + child(4) + emlsn(8)
            ItemBody::Interior { .. } => 2 + self.key_suffix.len() + 4 + 8,
        }
    }

    pub fn element(&self) -> &[u8] {
        match &self.body {
            ItemBody::Leaf { element } => element,
            ItemBody::Interior { .. } => panic!("element() on interior item"),
        }
    }

    pub fn child(&self) -> PageID {
        match &self.body {
            ItemBody::Interior { child, .. } => *child,
            ItemBody::Leaf { .. } => panic!("child() on leaf item"),
        }
    }

    pub fn emlsn(&self) -> Lsn {
        match &self.body {
            ItemBody::Interior { emlsn, .. } => *emlsn,
            ItemBody::Leaf { .. } => panic!("emlsn() on leaf item"),
        }
    }
}

/// Where a key routes to inside an interior page.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChildSlot {
    Pid0,
    Slot(usize),
}

/// Parsed in-memory form of a Foster B-tree page.
///
/// Leaves (`level == 1`) carry (key, element) items; interior nodes carry
/// (separator, child, emlsn) items plus the leftmost child `pid0`. The
/// `foster` pointer is a same-level right link installed by splits until
/// the parent adopts the new sibling.
#[derive(Clone, Debug)]
pub struct BTreePage {
    pub hdr: PageHeader,
    pub root: PageID,
    pub pid0: PageID,
    pub pid0_emlsn: Lsn,
    pub foster: PageID,
    pub foster_emlsn: Lsn,
    pub level: u16,
    pub btflags: u16,
    pub prefix: Vec<u8>,
    pub fence_low: KeyStr,
    pub fence_high: KeyStr,
    pub chain_fence_high: KeyStr,
    items: Vec<BTreeItem>,
}

impl BTreePage {
    /// An empty, unformatted frame placeholder.
    pub fn empty() -> Self {
        Self {
            hdr: PageHeader::new(0, 0, PageTag::Btree),
            root: 0,
            pid0: 0,
            pid0_emlsn: Lsn::NULL,
            foster: 0,
            foster_emlsn: Lsn::NULL,
            level: 0,
            btflags: 0,
            prefix: Vec::new(),
            fence_low: KeyStr::empty(),
            fence_high: KeyStr::empty(),
            chain_fence_high: KeyStr::empty(),
            items: Vec::new(),
        }
    }

    /// Format a fresh page. The prefix shared by all keys of the page is
    /// the common prefix of the two fences (unless the high fence is the
    /// supremum, in which case no compression applies).
    #[allow(clippy::too_many_arguments)]
    pub fn format(
        pid: PageID,
        store: StoreID,
        root: PageID,
        level: u16,
        fence_low: KeyStr,
        fence_high: KeyStr,
        btflags: u16,
        chain_fence_high: KeyStr,
    ) -> Self {
        let prefix = if btflags & BT_HIGH_SUPREMUM != 0 {
            Vec::new()
        } else {
            let n = fence_low.common_prefix_len(&fence_high);
            fence_low.as_bytes()[..n].to_vec()
        };
        Self {
            hdr: PageHeader::new(pid, store, PageTag::Btree),
            root,
            pid0: 0,
            pid0_emlsn: Lsn::NULL,
            foster: 0,
            foster_emlsn: Lsn::NULL,
            level,
            btflags,
            prefix,
            fence_low,
            fence_high,
            chain_fence_high,
            items: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 1
    }

    pub fn is_root(&self) -> bool {
        self.hdr.pid == self.root
    }

    pub fn nrecs(&self) -> usize {
        self.items.len()
    }

    pub fn item(&self, i: usize) -> &BTreeItem {
        &self.items[i]
    }

    pub fn item_mut(&mut self, i: usize) -> &mut BTreeItem {
        &mut self.items[i]
    }

    pub fn items(&self) -> &[BTreeItem] {
        &self.items
    }

    pub fn key_at(&self, i: usize) -> KeyStr {
        let mut bytes = self.prefix.clone();
        bytes.extend_from_slice(&self.items[i].key_suffix);
        KeyStr::from_vec(bytes)
    }

    fn suffix_of(&self, key: &KeyStr) -> Vec<u8> {
        debug_assert!(key.starts_with(&self.prefix));
        key.suffix(self.prefix.len()).to_vec()
    }

    /// Binary search for `key`. Ok(slot) on exact match, Err(slot) with
    /// the insertion position otherwise.
    pub fn search(&self, key: &KeyStr) -> Result<usize, usize> {
        if !key.starts_with(&self.prefix) {
            // key is outside the compressed range; order against full keys
            return self
                .items
                .iter()
                .enumerate()
                .find(|(i, _)| self.key_at(*i) >= *key)
                .map(|(i, _)| {
                    if self.key_at(i) == *key {
                        Ok(i)
                    } else {
                        Err(i)
                    }
                })
                .unwrap_or(Err(self.items.len()));
        }
        let suffix = key.suffix(self.prefix.len());
        self.items
            .binary_search_by(|item| item.key_suffix.as_slice().cmp(suffix))
    }

    /// Route a key inside an interior page: the child whose separator is
    /// the greatest one ≤ key, or pid0 when every separator is greater.
    pub fn child_slot_for(&self, key: &KeyStr) -> ChildSlot {
        debug_assert!(!self.is_leaf());
        match self.search(key) {
            Ok(i) => ChildSlot::Slot(i),
            Err(0) => ChildSlot::Pid0,
            Err(i) => ChildSlot::Slot(i - 1),
        }
    }

    /// True when the key is right of the page's high fence and must be
    /// found through the foster chain.
    pub fn is_above_high_fence(&self, key: &KeyStr) -> bool {
        if self.btflags & BT_HIGH_SUPREMUM != 0 {
            return false;
        }
        *key >= self.fence_high
    }

    pub fn is_in_fences(&self, key: &KeyStr) -> bool {
        *key >= self.fence_low && !self.is_above_high_fence(key)
    }

    // -- space accounting ---------------------------------------------

    pub fn used_space(&self) -> usize {
        BT_FIXED
            + 2
            + self.prefix.len()
            + self.fence_low.length_as_keystr()
            + self.fence_high.length_as_keystr()
            + self.chain_fence_high.length_as_keystr()
            + self.items.iter().map(|it| it.disk_size()).sum::<usize>()
    }

    pub fn capacity() -> usize {
        PAGE_SIZE - PAGE_HEADER_SIZE
    }

    pub fn free_space(&self) -> usize {
        Self::capacity().saturating_sub(self.used_space())
    }

    pub fn fits(&self, key: &KeyStr, element_len: usize) -> bool {
        let suffix_len = key.len().saturating_sub(self.prefix.len());
        let need = 1 + 2 + suffix_len + 2 + element_len;
        self.free_space() >= need
    }

    // -- mutations (called from operations and from redo) -------------

    pub fn insert_leaf_item(&mut self, key: &KeyStr, ghost: bool, element: Vec<u8>) {
        debug_assert!(self.is_leaf());
        let slot = match self.search(key) {
            Ok(_) => panic!("insert_leaf_item: key already present"),
            Err(slot) => slot,
        };
        self.items.insert(
            slot,
            BTreeItem {
                key_suffix: self.suffix_of(key),
                ghost,
                body: ItemBody::Leaf { element },
            },
        );
    }

    pub fn insert_interior_item(&mut self, key: &KeyStr, child: PageID, emlsn: Lsn) {
        debug_assert!(!self.is_leaf());
        let slot = match self.search(key) {
            Ok(_) => panic!("insert_interior_item: separator already present"),
            Err(slot) => slot,
        };
        self.items.insert(
            slot,
            BTreeItem {
                key_suffix: self.suffix_of(key),
                ghost: false,
                body: ItemBody::Interior { child, emlsn },
            },
        );
    }

    pub fn remove_item_at(&mut self, slot: usize) -> BTreeItem {
        self.items.remove(slot)
    }

    pub fn truncate_items_from(&mut self, slot: usize) -> Vec<BTreeItem> {
        self.items.split_off(slot)
    }

    pub fn extend_items(&mut self, items: Vec<BTreeItem>) {
        self.items.extend(items);
        debug_assert!(self.items_sorted());
    }

    fn items_sorted(&self) -> bool {
        self.items
            .windows(2)
            .all(|w| w[0].key_suffix < w[1].key_suffix)
    }

    pub fn mark_ghost(&mut self, slot: usize) {
        self.items[slot].ghost = true;
    }

    pub fn replace_ghost(&mut self, slot: usize, element: Vec<u8>) {
        let item = &mut self.items[slot];
        item.ghost = false;
        item.body = ItemBody::Leaf { element };
    }

    pub fn set_element(&mut self, slot: usize, element: Vec<u8>) {
        self.items[slot].body = ItemBody::Leaf { element };
    }

    /// Drop all ghost items, returning how many were reclaimed.
    pub fn reclaim_ghosts(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|it| !it.ghost);
        before - self.items.len()
    }

    pub fn ghost_count(&self) -> usize {
        self.items.iter().filter(|it| it.ghost).count()
    }

    /// Locate the slot whose child pointer equals `pid` (swizzled or
    /// not). Used to update EMLSNs and to unswizzle on eviction.
    pub fn find_pid_slot(&self, pid: PageID) -> Option<ChildSlot> {
        if self.pid0 == pid {
            return Some(ChildSlot::Pid0);
        }
        self.items
            .iter()
            .position(|it| matches!(it.body, ItemBody::Interior { child, .. } if child == pid))
            .map(ChildSlot::Slot)
    }

    pub fn child_at(&self, slot: ChildSlot) -> (PageID, Lsn) {
        match slot {
            ChildSlot::Pid0 => (self.pid0, self.pid0_emlsn),
            ChildSlot::Slot(i) => (self.items[i].child(), self.items[i].emlsn()),
        }
    }

    pub fn set_child(&mut self, slot: ChildSlot, pid: PageID) {
        match slot {
            ChildSlot::Pid0 => self.pid0 = pid,
            ChildSlot::Slot(i) => match &mut self.items[i].body {
                ItemBody::Interior { child, .. } => *child = pid,
                ItemBody::Leaf { .. } => panic!("set_child on leaf item"),
            },
        }
    }

    pub fn set_child_emlsn(&mut self, slot: ChildSlot, lsn: Lsn) {
        match slot {
            ChildSlot::Pid0 => self.pid0_emlsn = lsn,
            ChildSlot::Slot(i) => match &mut self.items[i].body {
                ItemBody::Interior { emlsn, .. } => *emlsn = lsn,
                ItemBody::Leaf { .. } => panic!("set_child_emlsn on leaf item"),
            },
        }
    }

    /// Whether any child pointer (pid0, foster or an item) is swizzled.
    pub fn has_swizzled_pointer(&self) -> bool {
        if is_swizzled(self.pid0) || is_swizzled(self.foster) {
            return true;
        }
        !self.is_leaf()
            && self.items.iter().any(|it| match it.body {
                ItemBody::Interior { child, .. } => is_swizzled(child),
                _ => false,
            })
    }

    // -- serialization ------------------------------------------------

    pub fn to_image(&self) -> PageImage {
        debug_assert!(!self.has_swizzled_pointer());
        let mut w = DbWriter::with_capacity(PAGE_SIZE);
        w.write(&self.root);
        w.write(&self.pid0);
        w.write(&self.pid0_emlsn);
        w.write(&self.foster);
        w.write(&self.foster_emlsn);
        w.write(&self.level);
        w.write(&self.btflags);
        w.write(&(self.items.len() as u16));
        w.write(&self.prefix);
        w.write(&self.fence_low);
        w.write(&self.fence_high);
        w.write(&self.chain_fence_high);
        for item in &self.items {
            match &item.body {
                ItemBody::Leaf { element } => {
                    w.write(&(item.ghost as u8));
                    w.write(&item.key_suffix);
                    w.write(element);
                }
                ItemBody::Interior { child, emlsn } => {
                    w.write(&item.key_suffix);
                    w.write(child);
                    w.write(emlsn);
                }
            }
        }
        let body = w.to_padded_bytes(PAGE_SIZE - PAGE_HEADER_SIZE);

        let mut img = new_page_image();
        self.hdr.encode_into(&mut img[..]);
        img[PAGE_HEADER_SIZE..].copy_from_slice(&body);
        seal_image(&mut img[..]);
        img
    }

    pub fn parse(img: &PageImage) -> Result<Self, DbError> {
        let hdr = PageHeader::decode(&img[..])?;
        if hdr.tag != PageTag::Btree {
            return Err(DbError::Corrupt(format!(
                "expected btree page, got {:?}",
                hdr.tag
            )));
        }
        let mut r = Cursor::new(&img[PAGE_HEADER_SIZE..]);
        let root = u32::decode_from(&mut r);
        let pid0 = u32::decode_from(&mut r);
        let pid0_emlsn = Lsn::decode_from(&mut r);
        let foster = u32::decode_from(&mut r);
        let foster_emlsn = Lsn::decode_from(&mut r);
        let level = u16::decode_from(&mut r);
        let btflags = u16::decode_from(&mut r);
        let nrecs = u16::decode_from(&mut r);
        let prefix = Vec::<u8>::decode_from(&mut r);
        let fence_low = KeyStr::decode_from(&mut r);
        let fence_high = KeyStr::decode_from(&mut r);
        let chain_fence_high = KeyStr::decode_from(&mut r);

        let mut items = Vec::with_capacity(nrecs as usize);
        for _ in 0..nrecs {
            if level == 1 {
                let ghost = u8::decode_from(&mut r) != 0;
                let key_suffix = Vec::<u8>::decode_from(&mut r);
                let element = Vec::<u8>::decode_from(&mut r);
                items.push(BTreeItem {
                    key_suffix,
                    ghost,
                    body: ItemBody::Leaf { element },
                });
            } else {
                let key_suffix = Vec::<u8>::decode_from(&mut r);
                let child = u32::decode_from(&mut r);
                let emlsn = Lsn::decode_from(&mut r);
                items.push(BTreeItem {
                    key_suffix,
                    ghost: false,
                    body: ItemBody::Interior { child, emlsn },
                });
            }
        }

        Ok(Self {
            hdr,
            root,
            pid0,
            pid0_emlsn,
            foster,
            foster_emlsn,
            level,
            btflags,
            prefix,
            fence_low,
            fence_high,
            chain_fence_high,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> BTreePage {
        let mut page = BTreePage::format(
            5,
            1,
            5,
            1,
            KeyStr::empty(),
            KeyStr::empty(),
            BT_HIGH_SUPREMUM | BT_CHAIN_HIGH_SUPREMUM,
            KeyStr::empty(),
        );
        page.insert_leaf_item(&KeyStr::new(b"bbb"), false, b"1".to_vec());
        page.insert_leaf_item(&KeyStr::new(b"ddd"), false, b"2".to_vec());
        page
    }

    #[test]
    fn test_search_and_insert_order() {
        let mut page = leaf();
        page.insert_leaf_item(&KeyStr::new(b"ccc"), false, b"3".to_vec());

        assert_eq!(page.search(&KeyStr::new(b"bbb")), Ok(0));
        assert_eq!(page.search(&KeyStr::new(b"ccc")), Ok(1));
        assert_eq!(page.search(&KeyStr::new(b"ddd")), Ok(2));
        assert_eq!(page.search(&KeyStr::new(b"aaa")), Err(0));
        assert_eq!(page.search(&KeyStr::new(b"zzz")), Err(3));
    }

    #[test]
    fn test_image_roundtrip() {
        let page = leaf();
        let img = page.to_image();
        let back = BTreePage::parse(&img).unwrap();
        assert_eq!(back.nrecs(), 2);
        assert_eq!(back.key_at(0), KeyStr::new(b"bbb"));
        assert_eq!(back.item(1).element(), b"2");
        assert_eq!(back.level, 1);
    }

    #[test]
    fn test_ghosts() {
        let mut page = leaf();
        page.mark_ghost(0);
        assert_eq!(page.ghost_count(), 1);
        page.replace_ghost(0, b"new".to_vec());
        assert_eq!(page.ghost_count(), 0);
        assert_eq!(page.item(0).element(), b"new");

        page.mark_ghost(1);
        assert_eq!(page.reclaim_ghosts(), 1);
        assert_eq!(page.nrecs(), 1);
    }

    #[test]
    fn test_space_accounting() {
        let page = leaf();
        let used = page.used_space();
        assert!(used < BTreePage::capacity());
        assert_eq!(page.free_space(), BTreePage::capacity() - used);
    }
}
