use std::collections::HashMap;

use bit_vec::BitVec;

use crate::{
    error::DbError,
    lsn::Lsn,
    page::{new_page_image, seal_image, PageHeader, PageImage, PageTag, PAGE_HEADER_SIZE},
    page_id::{PageID, StoreID},
};

/// Pages covered by one allocation bitmap page.
pub const EXTENT_SIZE: u32 = 32768;

/// First data pid: 0 = volume header, 1 = stnode page, 2 = first bitmap.
pub const FIRST_DATA_PID: PageID = 3;

/// The bitmap page at the head of extent `e`.
pub fn alloc_page_pid(extent: u32) -> PageID {
    if extent == 0 {
        2
    } else {
        extent * EXTENT_SIZE
    }
}

/// In-memory shadow of the allocation bitmap pages.
///
/// Mutations are logged by the volume as single-log system transactions
/// and replayed against this cache during restart; the bitmap pages
/// themselves only reach disk on clean shutdown.
pub struct AllocCache {
    bitmap: BitVec,
    last_allocated: PageID,
    /// Clustering hint: last pid handed to each store.
    store_hint: HashMap<StoreID, PageID>,
    /// The cache reflects all allocation records up to here.
    pub lsn: Lsn,
}

impl AllocCache {
    pub fn new() -> Self {
        let mut cache = Self {
            bitmap: BitVec::from_elem(EXTENT_SIZE as usize, false),
            last_allocated: 0,
            store_hint: HashMap::new(),
            lsn: Lsn::NULL,
        };
        // metadata pids are never handed out
        cache.bitmap.set(0, true);
        cache.bitmap.set(1, true);
        cache.bitmap.set(2, true);
        cache
    }

    fn ensure_capacity(&mut self, pid: PageID) {
        while self.bitmap.len() <= pid as usize {
            let extent = (self.bitmap.len() / EXTENT_SIZE as usize) as u32;
            self.bitmap
                .grow(EXTENT_SIZE as usize, false);
            let head = alloc_page_pid(extent) as usize;
            if head < self.bitmap.len() {
                self.bitmap.set(head, true);
            }
        }
    }

    pub fn is_allocated(&self, pid: PageID) -> bool {
        self.bitmap.get(pid as usize).unwrap_or(false)
    }

    pub fn last_allocated_pid(&self) -> PageID {
        self.last_allocated
    }

    pub fn used_page_count(&self) -> usize {
        self.bitmap.iter().filter(|b| *b).count()
    }

    /// Pick a free pid, clustered with the store's previous allocation
    /// when requested.
    pub fn allocate(&mut self, store: StoreID, cluster: bool) -> PageID {
        let start = if cluster {
            self.store_hint.get(&store).copied().unwrap_or(FIRST_DATA_PID)
        } else {
            FIRST_DATA_PID
        };
        let mut pid = start;
        loop {
            self.ensure_capacity(pid);
            if !self.bitmap[pid as usize] {
                break;
            }
            pid += 1;
        }
        self.apply_alloc(pid);
        self.store_hint.insert(store, pid);
        pid
    }

    pub fn apply_alloc(&mut self, pid: PageID) {
        self.ensure_capacity(pid);
        self.bitmap.set(pid as usize, true);
        if pid > self.last_allocated {
            self.last_allocated = pid;
        }
    }

    pub fn apply_dealloc(&mut self, pid: PageID) {
        self.ensure_capacity(pid);
        self.bitmap.set(pid as usize, false);
    }

    // -- persistence ---------------------------------------------------

    /// Serialize every extent's bitmap page; written on clean shutdown.
    pub fn to_images(&self) -> Vec<(PageID, PageImage)> {
        let extents = self.bitmap.len() / EXTENT_SIZE as usize;
        let mut out = Vec::with_capacity(extents);
        let bytes = self.bitmap.to_bytes();
        let per_page = EXTENT_SIZE as usize / 8;
        for extent in 0..extents {
            let pid = alloc_page_pid(extent as u32);
            let mut img = new_page_image();
            let mut hdr = PageHeader::new(pid, 0, PageTag::Alloc);
            hdr.lsn = self.lsn;
            hdr.encode_into(&mut img[..]);
            let start = extent * per_page;
            let end = std::cmp::min(start + per_page, bytes.len());
            img[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + (end - start)]
                .copy_from_slice(&bytes[start..end]);
            seal_image(&mut img[..]);
            out.push((pid, img));
        }
        out
    }

    /// Rebuild from the bitmap pages found on disk.
    pub fn from_images(images: &[(u32, PageImage)]) -> Result<Self, DbError> {
        let mut cache = Self::new();
        let per_page = EXTENT_SIZE as usize / 8;
        let mut bytes = vec![0u8; images.len().max(1) * per_page];
        let mut min_lsn = Lsn::NULL;
        for (extent, img) in images {
            if crate::page::is_zero_image(&img[..]) {
                continue;
            }
            let hdr = PageHeader::decode(&img[..])?;
            if hdr.tag != PageTag::Alloc {
                return Err(DbError::Corrupt(format!(
                    "alloc page has tag {:?}",
                    hdr.tag
                )));
            }
            let start = *extent as usize * per_page;
            bytes[start..start + per_page]
                .copy_from_slice(&img[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + per_page]);
            if min_lsn.is_null() || hdr.lsn < min_lsn {
                min_lsn = hdr.lsn;
            }
        }
        cache.bitmap = BitVec::from_bytes(&bytes);
        cache.lsn = min_lsn;
        // metadata pids again (a fresh extent image may predate them)
        cache.bitmap.set(0, true);
        cache.bitmap.set(1, true);
        cache.bitmap.set(2, true);
        cache.last_allocated = (0..cache.bitmap.len())
            .rev()
            .find(|i| cache.bitmap[*i])
            .unwrap_or(0) as PageID;
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_skips_metadata_pages() {
        let mut cache = AllocCache::new();
        let pid = cache.allocate(1, true);
        assert_eq!(pid, FIRST_DATA_PID);
        assert!(cache.is_allocated(pid));
        assert!(cache.is_allocated(0));
        assert!(cache.is_allocated(2));
    }

    #[test]
    fn test_clustering_hint() {
        let mut cache = AllocCache::new();
        let a = cache.allocate(1, true);
        let b = cache.allocate(1, true);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_dealloc_and_reuse() {
        let mut cache = AllocCache::new();
        let a = cache.allocate(1, false);
        cache.apply_dealloc(a);
        assert!(!cache.is_allocated(a));
        let b = cache.allocate(2, false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_image_roundtrip() {
        let mut cache = AllocCache::new();
        for _ in 0..10 {
            cache.allocate(1, true);
        }
        cache.lsn = Lsn::new(1, 512);
        let images = cache.to_images();
        let with_extents: Vec<(u32, PageImage)> = images
            .into_iter()
            .enumerate()
            .map(|(i, (_, img))| (i as u32, img))
            .collect();
        let back = AllocCache::from_images(&with_extents).unwrap();
        assert_eq!(back.last_allocated_pid(), cache.last_allocated_pid());
        assert!(back.is_allocated(FIRST_DATA_PID));
    }
}
