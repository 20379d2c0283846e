use std::convert::TryInto;

use crate::{error::DbError, lsn::Lsn, page_id::PageID, page_id::StoreID};

/// Fixed page size of the engine. Everything on disk is a multiple of it.
pub const PAGE_SIZE: usize = 8192;

/// On-disk header: checksum(4) pid(4) store(4) lsn(8) tag(2) flags(2).
pub const PAGE_HEADER_SIZE: usize = 24;

/// Page is scheduled for deallocation; the cleaner drops it instead of
/// writing it out.
pub const PF_TO_BE_DELETED: u16 = 0x1;

pub type PageImage = Box<[u8; PAGE_SIZE]>;

pub fn new_page_image() -> PageImage {
    Box::new([0u8; PAGE_SIZE])
}

pub fn image_from_bytes(bytes: &[u8]) -> PageImage {
    assert_eq!(bytes.len(), PAGE_SIZE);
    let mut img = new_page_image();
    img.copy_from_slice(bytes);
    img
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PageTag {
    Alloc = 1,
    Stnode = 2,
    Btree = 3,
}

impl PageTag {
    pub fn from_u16(v: u16) -> Result<Self, DbError> {
        match v {
            1 => Ok(PageTag::Alloc),
            2 => Ok(PageTag::Stnode),
            3 => Ok(PageTag::Btree),
            _ => Err(DbError::Corrupt(format!("unknown page tag {}", v))),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PageHeader {
    pub pid: PageID,
    pub store: StoreID,
    pub lsn: Lsn,
    pub tag: PageTag,
    pub flags: u16,
}

impl PageHeader {
    pub fn new(pid: PageID, store: StoreID, tag: PageTag) -> Self {
        Self {
            pid,
            store,
            lsn: Lsn::NULL,
            tag,
            flags: 0,
        }
    }

    /// Write the header into an image. The checksum slot is filled by
    /// `seal_image` just before the image goes to disk.
    pub fn encode_into(&self, img: &mut [u8]) {
        img[4..8].copy_from_slice(&self.pid.to_le_bytes());
        img[8..12].copy_from_slice(&self.store.to_le_bytes());
        img[12..20].copy_from_slice(&self.lsn.to_u64().to_le_bytes());
        img[20..22].copy_from_slice(&(self.tag as u16).to_le_bytes());
        img[22..24].copy_from_slice(&self.flags.to_le_bytes());
    }

    pub fn decode(img: &[u8]) -> Result<Self, DbError> {
        let pid = u32::from_le_bytes(img[4..8].try_into().unwrap());
        let store = u32::from_le_bytes(img[8..12].try_into().unwrap());
        let lsn = Lsn::from_u64(u64::from_le_bytes(img[12..20].try_into().unwrap()));
        let tag = PageTag::from_u16(u16::from_le_bytes(img[20..22].try_into().unwrap()))?;
        let flags = u16::from_le_bytes(img[22..24].try_into().unwrap());
        Ok(Self {
            pid,
            store,
            lsn,
            tag,
            flags,
        })
    }
}

fn compute_checksum(img: &[u8]) -> u32 {
    crc32fast::hash(&img[4..])
}

/// Stamp the checksum into the first 4 bytes of the image.
pub fn seal_image(img: &mut [u8]) {
    let sum = compute_checksum(img);
    img[0..4].copy_from_slice(&sum.to_le_bytes());
}

/// Verify the stored checksum. An all-zero image (never written) passes.
pub fn verify_image(img: &[u8]) -> bool {
    let stored = u32::from_le_bytes(img[0..4].try_into().unwrap());
    if stored == 0 && img.iter().all(|b| *b == 0) {
        return true;
    }
    stored == compute_checksum(img)
}

pub fn is_zero_image(img: &[u8]) -> bool {
    img.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut img = new_page_image();
        let mut hdr = PageHeader::new(42, 1, PageTag::Btree);
        hdr.lsn = Lsn::new(1, 4096);
        hdr.encode_into(&mut img[..]);
        seal_image(&mut img[..]);

        assert!(verify_image(&img[..]));
        let back = PageHeader::decode(&img[..]).unwrap();
        assert_eq!(back.pid, 42);
        assert_eq!(back.store, 1);
        assert_eq!(back.lsn, Lsn::new(1, 4096));
        assert_eq!(back.tag, PageTag::Btree);
    }

    #[test]
    fn test_corruption_detected() {
        let mut img = new_page_image();
        let hdr = PageHeader::new(7, 1, PageTag::Alloc);
        hdr.encode_into(&mut img[..]);
        seal_image(&mut img[..]);
        img[100] ^= 0xff;
        assert!(!verify_image(&img[..]));
    }
}
