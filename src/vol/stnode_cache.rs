use std::io::Cursor;

use crate::{
    error::DbError,
    io::{DbWriter, Decodeable},
    lsn::Lsn,
    page::{new_page_image, seal_image, PageHeader, PageImage, PageTag, PAGE_HEADER_SIZE},
    page_id::{PageID, StoreID},
};

/// The stnode page is page 1 of every volume.
pub const STNODE_PID: PageID = 1;

/// Highest store number a volume can hold; store 0 is reserved.
pub const STNODE_MAX: StoreID = 1000;

#[derive(Copy, Clone, Default)]
struct StnodeEntry {
    root: PageID,
    flags: u32,
}

/// In-memory shadow of the store directory page: root page ID and flags
/// per store. Kept consistent with disk by redo of `create_store`
/// records, like the allocation cache.
pub struct StnodeCache {
    entries: Vec<StnodeEntry>,
    pub lsn: Lsn,
}

impl StnodeCache {
    pub fn new() -> Self {
        Self {
            entries: vec![StnodeEntry::default(); STNODE_MAX as usize + 1],
            lsn: Lsn::NULL,
        }
    }

    pub fn is_allocated(&self, snum: StoreID) -> bool {
        snum != 0 && snum <= STNODE_MAX && self.entries[snum as usize].root != 0
    }

    pub fn get_root_pid(&self, snum: StoreID) -> Option<PageID> {
        if self.is_allocated(snum) {
            Some(self.entries[snum as usize].root)
        } else {
            None
        }
    }

    /// Register a store in the first free slot.
    pub fn create_store(&mut self, root_pid: PageID) -> Result<StoreID, DbError> {
        for snum in 1..=STNODE_MAX {
            if self.entries[snum as usize].root == 0 {
                self.entries[snum as usize].root = root_pid;
                return Ok(snum);
            }
        }
        Err(DbError::Corrupt("store directory full".to_string()))
    }

    /// Redo form: slot number already decided.
    pub fn apply_create_store(&mut self, snum: StoreID, root_pid: PageID) {
        self.entries[snum as usize].root = root_pid;
    }

    pub fn set_root(&mut self, snum: StoreID, root_pid: PageID) {
        self.entries[snum as usize].root = root_pid;
    }

    pub fn all_stores(&self) -> Vec<(StoreID, PageID)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.root != 0)
            .map(|(snum, e)| (snum as StoreID, e.root))
            .collect()
    }

    // -- persistence ---------------------------------------------------

    pub fn to_image(&self) -> PageImage {
        let mut w = DbWriter::new();
        for e in &self.entries[1..] {
            w.write(&e.root);
            w.write(&e.flags);
        }
        let body = w.to_padded_bytes(crate::page::PAGE_SIZE - PAGE_HEADER_SIZE);

        let mut img = new_page_image();
        let mut hdr = PageHeader::new(STNODE_PID, 0, PageTag::Stnode);
        hdr.lsn = self.lsn;
        hdr.encode_into(&mut img[..]);
        img[PAGE_HEADER_SIZE..].copy_from_slice(&body);
        seal_image(&mut img[..]);
        img
    }

    pub fn from_image(img: &PageImage) -> Result<Self, DbError> {
        if crate::page::is_zero_image(&img[..]) {
            return Ok(Self::new());
        }
        let hdr = PageHeader::decode(&img[..])?;
        if hdr.tag != PageTag::Stnode {
            return Err(DbError::Corrupt(format!(
                "stnode page has tag {:?}",
                hdr.tag
            )));
        }
        let mut cache = Self::new();
        cache.lsn = hdr.lsn;
        let mut r = Cursor::new(&img[PAGE_HEADER_SIZE..]);
        for snum in 1..=STNODE_MAX {
            let root = u32::decode_from(&mut r);
            let flags = u32::decode_from(&mut r);
            cache.entries[snum as usize] = StnodeEntry { root, flags };
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let mut cache = StnodeCache::new();
        let s1 = cache.create_store(10).unwrap();
        let s2 = cache.create_store(20).unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        assert_eq!(cache.get_root_pid(s1), Some(10));
        assert_eq!(cache.get_root_pid(s2), Some(20));
        assert!(!cache.is_allocated(3));
        assert!(!cache.is_allocated(0));
    }

    #[test]
    fn test_image_roundtrip() {
        let mut cache = StnodeCache::new();
        cache.create_store(10).unwrap();
        cache.lsn = Lsn::new(2, 100);
        let img = cache.to_image();
        let back = StnodeCache::from_image(&img).unwrap();
        assert_eq!(back.get_root_pid(1), Some(10));
        assert_eq!(back.lsn, Lsn::new(2, 100));
    }
}
