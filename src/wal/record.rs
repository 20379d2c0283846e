use std::{convert::TryInto, io::Cursor};

use crate::{
    btree::page::{BTreePage, ChildSlot},
    error::DbError,
    io::{DbWriter, Decodeable, Encodeable},
    keystr::KeyStr,
    lsn::Lsn,
    page::{image_from_bytes, PAGE_SIZE},
    page_id::{PageID, StoreID},
};

/// Fixed record header:
/// len(4) kind(2) cat(1) pad(1) tid(8) prev(8) pid(4) page2_pid(4)
/// page_prv(8) page2_prv(8).
pub const LOG_HEADER_SIZE: usize = 48;

/// crc(4) + trailing len(4); the trailing length lets a scan run in
/// either direction.
pub const LOG_TRAILER_SIZE: usize = 8;

pub const MIN_RECORD_SIZE: usize = LOG_HEADER_SIZE + LOG_TRAILER_SIZE;

// category bits
pub const CAT_SYSTEM: u8 = 0x01;
pub const CAT_REDO: u8 = 0x02;
pub const CAT_UNDO: u8 = 0x04;
pub const CAT_CLR: u8 = 0x08;
pub const CAT_SSX: u8 = 0x10;
pub const CAT_MULTI_PAGE: u8 = 0x20;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum LogRecordKind {
    Comment = 1,
    Skip = 2,
    BenchmarkStart = 3,

    FormatVolume = 10,
    AddBackup = 11,
    RestoreBegin = 12,
    RestoreSegment = 13,
    PageRead = 14,
    PageWrite = 15,

    EvictPage = 20,
    FetchPage = 21,

    AllocPage = 30,
    DeallocPage = 31,
    CreateStore = 32,

    PageImgFormat = 40,
    UpdateEmlsn = 41,

    BtreeInsert = 50,
    BtreeRemove = 51,
    BtreeUpdate = 52,
    BtreeOverwrite = 53,
    BtreeGhostReserve = 54,
    BtreeGhostReclaim = 55,
    BtreeNorecSplit = 56,
    BtreeFosterRebalance = 57,
    BtreeFosterAdopt = 58,
    BtreeFosterDeadopt = 59,

    XctBegin = 70,
    XctEnd = 71,
    XctAbort = 72,
    XctEndGroup = 73,
    Compensate = 74,

    ChkptBegin = 80,
    ChkptEnd = 81,
}

impl LogRecordKind {
    pub fn from_u16(v: u16) -> Result<Self, DbError> {
        use LogRecordKind::*;
        let kind = match v {
            1 => Comment,
            2 => Skip,
            3 => BenchmarkStart,
            10 => FormatVolume,
            11 => AddBackup,
            12 => RestoreBegin,
            13 => RestoreSegment,
            14 => PageRead,
            15 => PageWrite,
            20 => EvictPage,
            21 => FetchPage,
            30 => AllocPage,
            31 => DeallocPage,
            32 => CreateStore,
            40 => PageImgFormat,
            41 => UpdateEmlsn,
            50 => BtreeInsert,
            51 => BtreeRemove,
            52 => BtreeUpdate,
            53 => BtreeOverwrite,
            54 => BtreeGhostReserve,
            55 => BtreeGhostReclaim,
            56 => BtreeNorecSplit,
            57 => BtreeFosterRebalance,
            58 => BtreeFosterAdopt,
            59 => BtreeFosterDeadopt,
            70 => XctBegin,
            71 => XctEnd,
            72 => XctAbort,
            73 => XctEndGroup,
            74 => Compensate,
            80 => ChkptBegin,
            81 => ChkptEnd,
            _ => return Err(DbError::BadLogRec(format!("unknown record kind {}", v))),
        };
        Ok(kind)
    }
}

/// An item carried by a rebalance record; keys are stored in full so the
/// destination page can re-derive its own prefix compression.
#[derive(Clone, Debug)]
pub struct MovedItem {
    pub key: KeyStr,
    pub ghost: bool,
    pub body: MovedBody,
}

#[derive(Clone, Debug)]
pub enum MovedBody {
    Leaf(Vec<u8>),
    Interior(PageID, Lsn),
}

impl Encodeable for MovedItem {
    fn encode(&self) -> Vec<u8> {
        let mut w = DbWriter::new();
        w.write(&self.key);
        w.write(&(self.ghost as u8));
        match &self.body {
            MovedBody::Leaf(element) => {
                w.write(&0u8);
                w.write(element);
            }
            MovedBody::Interior(child, emlsn) => {
                w.write(&1u8);
                w.write(child);
                w.write(emlsn);
            }
        }
        w.to_bytes()
    }
}

impl Decodeable for MovedItem {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let key = KeyStr::decode_from(reader);
        let ghost = u8::decode_from(reader) != 0;
        let body = match u8::decode_from(reader) {
            0 => MovedBody::Leaf(Vec::<u8>::decode_from(reader)),
            _ => MovedBody::Interior(u32::decode_from(reader), Lsn::decode_from(reader)),
        };
        MovedItem { key, ghost, body }
    }
}

#[derive(Clone, Debug)]
pub enum LogPayload {
    Comment {
        text: String,
    },
    Skip,
    BenchmarkStart,

    FormatVolume,
    AddBackup {
        path: String,
        backup_lsn: Lsn,
    },
    RestoreBegin {
        last_used_pid: PageID,
    },
    RestoreSegment {
        segment: u32,
        first_pid: PageID,
        page_count: u32,
    },
    PageRead {
        first_pid: PageID,
        count: u32,
    },
    PageWrite {
        first_pid: PageID,
        clean_lsn: Lsn,
        count: u32,
    },

    EvictPage {
        pid: PageID,
    },
    FetchPage {
        pid: PageID,
    },

    AllocPage {
        pid: PageID,
        store: StoreID,
    },
    DeallocPage {
        pid: PageID,
    },
    CreateStore {
        root_pid: PageID,
        snum: StoreID,
    },

    PageImgFormat {
        image: Vec<u8>,
    },
    UpdateEmlsn {
        child_pid: PageID,
        emlsn: Lsn,
    },

    BtreeInsert {
        store: StoreID,
        key: KeyStr,
        element: Vec<u8>,
    },
    BtreeRemove {
        store: StoreID,
        key: KeyStr,
        old_element: Vec<u8>,
    },
    BtreeUpdate {
        store: StoreID,
        key: KeyStr,
        old_element: Vec<u8>,
        new_element: Vec<u8>,
    },
    BtreeOverwrite {
        store: StoreID,
        key: KeyStr,
        offset: u16,
        old_part: Vec<u8>,
        new_part: Vec<u8>,
    },
    BtreeGhostReserve {
        key: KeyStr,
        element_len: u16,
    },
    BtreeGhostReclaim {
        keys: Vec<KeyStr>,
    },
    BtreeNorecSplit {
        store: StoreID,
        root: PageID,
        level: u16,
        new_pid: PageID,
        split_key: KeyStr,
        fence_high: KeyStr,
        btflags_new: u16,
        chain_fence_high: KeyStr,
        chain_supremum: bool,
        foster: PageID,
        foster_emlsn: Lsn,
    },
    BtreeFosterRebalance {
        split_key: KeyStr,
        moved: Vec<MovedItem>,
    },
    BtreeFosterAdopt {
        separator: KeyStr,
        new_child: PageID,
        new_child_emlsn: Lsn,
    },
    BtreeFosterDeadopt {
        separator: KeyStr,
        child_pid: PageID,
        child_emlsn: Lsn,
    },

    XctBegin,
    XctEnd,
    XctAbort,
    XctEndGroup {
        tids: Vec<u64>,
    },
    Compensate,

    ChkptBegin,
    ChkptEnd {
        active_txs: Vec<(u64, Lsn)>,
        dirty_pages: Vec<(PageID, Lsn)>,
    },
}

impl LogPayload {
    pub fn kind(&self) -> LogRecordKind {
        use LogRecordKind as K;
        match self {
            LogPayload::Comment { .. } => K::Comment,
            LogPayload::Skip => K::Skip,
            LogPayload::BenchmarkStart => K::BenchmarkStart,
            LogPayload::FormatVolume => K::FormatVolume,
            LogPayload::AddBackup { .. } => K::AddBackup,
            LogPayload::RestoreBegin { .. } => K::RestoreBegin,
            LogPayload::RestoreSegment { .. } => K::RestoreSegment,
            LogPayload::PageRead { .. } => K::PageRead,
            LogPayload::PageWrite { .. } => K::PageWrite,
            LogPayload::EvictPage { .. } => K::EvictPage,
            LogPayload::FetchPage { .. } => K::FetchPage,
            LogPayload::AllocPage { .. } => K::AllocPage,
            LogPayload::DeallocPage { .. } => K::DeallocPage,
            LogPayload::CreateStore { .. } => K::CreateStore,
            LogPayload::PageImgFormat { .. } => K::PageImgFormat,
            LogPayload::UpdateEmlsn { .. } => K::UpdateEmlsn,
            LogPayload::BtreeInsert { .. } => K::BtreeInsert,
            LogPayload::BtreeRemove { .. } => K::BtreeRemove,
            LogPayload::BtreeUpdate { .. } => K::BtreeUpdate,
            LogPayload::BtreeOverwrite { .. } => K::BtreeOverwrite,
            LogPayload::BtreeGhostReserve { .. } => K::BtreeGhostReserve,
            LogPayload::BtreeGhostReclaim { .. } => K::BtreeGhostReclaim,
            LogPayload::BtreeNorecSplit { .. } => K::BtreeNorecSplit,
            LogPayload::BtreeFosterRebalance { .. } => K::BtreeFosterRebalance,
            LogPayload::BtreeFosterAdopt { .. } => K::BtreeFosterAdopt,
            LogPayload::BtreeFosterDeadopt { .. } => K::BtreeFosterDeadopt,
            LogPayload::XctBegin => K::XctBegin,
            LogPayload::XctEnd => K::XctEnd,
            LogPayload::XctAbort => K::XctAbort,
            LogPayload::XctEndGroup { .. } => K::XctEndGroup,
            LogPayload::Compensate => K::Compensate,
            LogPayload::ChkptBegin => K::ChkptBegin,
            LogPayload::ChkptEnd { .. } => K::ChkptEnd,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut w = DbWriter::new();
        match self {
            LogPayload::Comment { text } => w.write(text),
            LogPayload::Skip
            | LogPayload::BenchmarkStart
            | LogPayload::FormatVolume
            | LogPayload::XctBegin
            | LogPayload::XctEnd
            | LogPayload::XctAbort
            | LogPayload::Compensate
            | LogPayload::ChkptBegin => {}
            LogPayload::AddBackup { path, backup_lsn } => {
                w.write(path);
                w.write(backup_lsn);
            }
            LogPayload::RestoreBegin { last_used_pid } => w.write(last_used_pid),
            LogPayload::RestoreSegment {
                segment,
                first_pid,
                page_count,
            } => {
                w.write(segment);
                w.write(first_pid);
                w.write(page_count);
            }
            LogPayload::PageRead { first_pid, count } => {
                w.write(first_pid);
                w.write(count);
            }
            LogPayload::PageWrite {
                first_pid,
                clean_lsn,
                count,
            } => {
                w.write(first_pid);
                w.write(clean_lsn);
                w.write(count);
            }
            LogPayload::EvictPage { pid } | LogPayload::FetchPage { pid } => w.write(pid),
            LogPayload::AllocPage { pid, store } => {
                w.write(pid);
                w.write(store);
            }
            LogPayload::DeallocPage { pid } => w.write(pid),
            LogPayload::CreateStore { root_pid, snum } => {
                w.write(root_pid);
                w.write(snum);
            }
            LogPayload::PageImgFormat { image } => {
                // raw image, length implied by the record length
                w.write_bytes(image);
            }
            LogPayload::UpdateEmlsn { child_pid, emlsn } => {
                w.write(child_pid);
                w.write(emlsn);
            }
            LogPayload::BtreeInsert { store, key, element } => {
                w.write(store);
                w.write(key);
                w.write(element);
            }
            LogPayload::BtreeRemove {
                store,
                key,
                old_element,
            } => {
                w.write(store);
                w.write(key);
                w.write(old_element);
            }
            LogPayload::BtreeUpdate {
                store,
                key,
                old_element,
                new_element,
            } => {
                w.write(store);
                w.write(key);
                w.write(old_element);
                w.write(new_element);
            }
            LogPayload::BtreeOverwrite {
                store,
                key,
                offset,
                old_part,
                new_part,
            } => {
                w.write(store);
                w.write(key);
                w.write(offset);
                w.write(old_part);
                w.write(new_part);
            }
            LogPayload::BtreeGhostReserve { key, element_len } => {
                w.write(key);
                w.write(element_len);
            }
            LogPayload::BtreeGhostReclaim { keys } => {
                w.write(&(keys.len() as u16));
                for k in keys {
                    w.write(k);
                }
            }
            LogPayload::BtreeNorecSplit {
                store,
                root,
                level,
                new_pid,
                split_key,
                fence_high,
                btflags_new,
                chain_fence_high,
                chain_supremum,
                foster,
                foster_emlsn,
            } => {
                w.write(store);
                w.write(root);
                w.write(level);
                w.write(new_pid);
                w.write(split_key);
                w.write(fence_high);
                w.write(btflags_new);
                w.write(chain_fence_high);
                w.write(chain_supremum);
                w.write(foster);
                w.write(foster_emlsn);
            }
            LogPayload::BtreeFosterRebalance { split_key, moved } => {
                w.write(split_key);
                w.write(&(moved.len() as u16));
                for item in moved {
                    w.write(item);
                }
            }
            LogPayload::BtreeFosterAdopt {
                separator,
                new_child,
                new_child_emlsn,
            } => {
                w.write(separator);
                w.write(new_child);
                w.write(new_child_emlsn);
            }
            LogPayload::BtreeFosterDeadopt {
                separator,
                child_pid,
                child_emlsn,
            } => {
                w.write(separator);
                w.write(child_pid);
                w.write(child_emlsn);
            }
            LogPayload::XctEndGroup { tids } => {
                w.write(&(tids.len() as u16));
                for t in tids {
                    w.write(t);
                }
            }
            LogPayload::ChkptEnd {
                active_txs,
                dirty_pages,
            } => {
                w.write(&(active_txs.len() as u32));
                for (tid, lsn) in active_txs {
                    w.write(tid);
                    w.write(lsn);
                }
                w.write(&(dirty_pages.len() as u32));
                for (pid, lsn) in dirty_pages {
                    w.write(pid);
                    w.write(lsn);
                }
            }
        }
        w.to_bytes()
    }

    fn decode_body(kind: LogRecordKind, body: &[u8]) -> Result<Self, DbError> {
        use LogRecordKind as K;
        let mut r = Cursor::new(body);
        let payload = match kind {
            K::Comment => LogPayload::Comment {
                text: String::decode_from(&mut r),
            },
            K::Skip => LogPayload::Skip,
            K::BenchmarkStart => LogPayload::BenchmarkStart,
            K::FormatVolume => LogPayload::FormatVolume,
            K::AddBackup => LogPayload::AddBackup {
                path: String::decode_from(&mut r),
                backup_lsn: Lsn::decode_from(&mut r),
            },
            K::RestoreBegin => LogPayload::RestoreBegin {
                last_used_pid: u32::decode_from(&mut r),
            },
            K::RestoreSegment => LogPayload::RestoreSegment {
                segment: u32::decode_from(&mut r),
                first_pid: u32::decode_from(&mut r),
                page_count: u32::decode_from(&mut r),
            },
            K::PageRead => LogPayload::PageRead {
                first_pid: u32::decode_from(&mut r),
                count: u32::decode_from(&mut r),
            },
            K::PageWrite => LogPayload::PageWrite {
                first_pid: u32::decode_from(&mut r),
                clean_lsn: Lsn::decode_from(&mut r),
                count: u32::decode_from(&mut r),
            },
            K::EvictPage => LogPayload::EvictPage {
                pid: u32::decode_from(&mut r),
            },
            K::FetchPage => LogPayload::FetchPage {
                pid: u32::decode_from(&mut r),
            },
            K::AllocPage => LogPayload::AllocPage {
                pid: u32::decode_from(&mut r),
                store: u32::decode_from(&mut r),
            },
            K::DeallocPage => LogPayload::DeallocPage {
                pid: u32::decode_from(&mut r),
            },
            K::CreateStore => LogPayload::CreateStore {
                root_pid: u32::decode_from(&mut r),
                snum: u32::decode_from(&mut r),
            },
            K::PageImgFormat => {
                if body.len() != PAGE_SIZE {
                    return Err(DbError::BadLogRec(format!(
                        "page image record with body of {} bytes",
                        body.len()
                    )));
                }
                LogPayload::PageImgFormat {
                    image: body.to_vec(),
                }
            }
            K::UpdateEmlsn => LogPayload::UpdateEmlsn {
                child_pid: u32::decode_from(&mut r),
                emlsn: Lsn::decode_from(&mut r),
            },
            K::BtreeInsert => LogPayload::BtreeInsert {
                store: u32::decode_from(&mut r),
                key: KeyStr::decode_from(&mut r),
                element: Vec::<u8>::decode_from(&mut r),
            },
            K::BtreeRemove => LogPayload::BtreeRemove {
                store: u32::decode_from(&mut r),
                key: KeyStr::decode_from(&mut r),
                old_element: Vec::<u8>::decode_from(&mut r),
            },
            K::BtreeUpdate => LogPayload::BtreeUpdate {
                store: u32::decode_from(&mut r),
                key: KeyStr::decode_from(&mut r),
                old_element: Vec::<u8>::decode_from(&mut r),
                new_element: Vec::<u8>::decode_from(&mut r),
            },
            K::BtreeOverwrite => LogPayload::BtreeOverwrite {
                store: u32::decode_from(&mut r),
                key: KeyStr::decode_from(&mut r),
                offset: u16::decode_from(&mut r),
                old_part: Vec::<u8>::decode_from(&mut r),
                new_part: Vec::<u8>::decode_from(&mut r),
            },
            K::BtreeGhostReserve => LogPayload::BtreeGhostReserve {
                key: KeyStr::decode_from(&mut r),
                element_len: u16::decode_from(&mut r),
            },
            K::BtreeGhostReclaim => {
                let n = u16::decode_from(&mut r);
                let keys = (0..n).map(|_| KeyStr::decode_from(&mut r)).collect();
                LogPayload::BtreeGhostReclaim { keys }
            }
            K::BtreeNorecSplit => LogPayload::BtreeNorecSplit {
                store: u32::decode_from(&mut r),
                root: u32::decode_from(&mut r),
                level: u16::decode_from(&mut r),
                new_pid: u32::decode_from(&mut r),
                split_key: KeyStr::decode_from(&mut r),
                fence_high: KeyStr::decode_from(&mut r),
                btflags_new: u16::decode_from(&mut r),
                chain_fence_high: KeyStr::decode_from(&mut r),
                chain_supremum: bool::decode_from(&mut r),
                foster: u32::decode_from(&mut r),
                foster_emlsn: Lsn::decode_from(&mut r),
            },
            K::BtreeFosterRebalance => {
                let split_key = KeyStr::decode_from(&mut r);
                let n = u16::decode_from(&mut r);
                let moved = (0..n).map(|_| MovedItem::decode_from(&mut r)).collect();
                LogPayload::BtreeFosterRebalance { split_key, moved }
            }
            K::BtreeFosterAdopt => LogPayload::BtreeFosterAdopt {
                separator: KeyStr::decode_from(&mut r),
                new_child: u32::decode_from(&mut r),
                new_child_emlsn: Lsn::decode_from(&mut r),
            },
            K::BtreeFosterDeadopt => LogPayload::BtreeFosterDeadopt {
                separator: KeyStr::decode_from(&mut r),
                child_pid: u32::decode_from(&mut r),
                child_emlsn: Lsn::decode_from(&mut r),
            },
            K::XctBegin => LogPayload::XctBegin,
            K::XctEnd => LogPayload::XctEnd,
            K::XctAbort => LogPayload::XctAbort,
            K::XctEndGroup => {
                let n = u16::decode_from(&mut r);
                let tids = (0..n).map(|_| u64::decode_from(&mut r)).collect();
                LogPayload::XctEndGroup { tids }
            }
            K::Compensate => LogPayload::Compensate,
            K::ChkptBegin => LogPayload::ChkptBegin,
            K::ChkptEnd => {
                let ntx = u32::decode_from(&mut r);
                let active_txs = (0..ntx)
                    .map(|_| (u64::decode_from(&mut r), Lsn::decode_from(&mut r)))
                    .collect();
                let ndp = u32::decode_from(&mut r);
                let dirty_pages = (0..ndp)
                    .map(|_| (u32::decode_from(&mut r), Lsn::decode_from(&mut r)))
                    .collect();
                LogPayload::ChkptEnd {
                    active_txs,
                    dirty_pages,
                }
            }
        };
        Ok(payload)
    }
}

#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Total encoded length, header and trailer included.
    pub len: u32,
    pub cat: u8,
    pub tid: u64,
    /// Per-transaction undo chain; for a CLR this is `undo_nxt`.
    pub prev_lsn: Lsn,
    pub pid: PageID,
    pub page2_pid: PageID,
    pub page_prv: Lsn,
    pub page2_prv: Lsn,
    pub payload: LogPayload,
    /// Position in the log; filled in by insert/fetch, not serialized.
    pub lsn: Lsn,
}

impl LogRecord {
    pub fn new(cat: u8, payload: LogPayload) -> Self {
        let mut rec = Self {
            len: 0,
            cat,
            tid: 0,
            prev_lsn: Lsn::NULL,
            pid: 0,
            page2_pid: 0,
            page_prv: Lsn::NULL,
            page2_prv: Lsn::NULL,
            payload,
            lsn: Lsn::NULL,
        };
        rec.len = (LOG_HEADER_SIZE + rec.payload.encode_body().len() + LOG_TRAILER_SIZE) as u32;
        rec
    }

    pub fn kind(&self) -> LogRecordKind {
        self.payload.kind()
    }

    pub fn is_system(&self) -> bool {
        self.cat & CAT_SYSTEM != 0
    }

    pub fn is_redo(&self) -> bool {
        self.cat & CAT_REDO != 0
    }

    pub fn is_undoable(&self) -> bool {
        self.cat & CAT_UNDO != 0
    }

    pub fn is_clr(&self) -> bool {
        self.cat & CAT_CLR != 0
    }

    pub fn is_ssx(&self) -> bool {
        self.cat & CAT_SSX != 0
    }

    pub fn is_multi_page(&self) -> bool {
        self.cat & CAT_MULTI_PAGE != 0
    }

    /// The page-chain back pointer as seen from `pid` (a multi-page
    /// record carries one chain link per page).
    pub fn page_prev_for(&self, pid: PageID) -> Lsn {
        if pid == self.pid {
            self.page_prv
        } else if pid == self.page2_pid {
            self.page2_prv
        } else {
            Lsn::NULL
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.payload.encode_body();
        let len = (LOG_HEADER_SIZE + body.len() + LOG_TRAILER_SIZE) as u32;
        let mut buf = Vec::with_capacity(len as usize);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&(self.kind() as u16).to_le_bytes());
        buf.push(self.cat);
        buf.push(0);
        buf.extend_from_slice(&self.tid.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.pid.to_le_bytes());
        buf.extend_from_slice(&self.page2_pid.to_le_bytes());
        buf.extend_from_slice(&self.page_prv.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.page2_prv.to_u64().to_le_bytes());
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        debug_assert_eq!(buf.len(), len as usize);
        buf
    }

    /// A skip record padding exactly `total_len` bytes (segment or
    /// partition tail). The body is all zeros so the checksum still
    /// verifies on decode.
    pub fn encode_skip(total_len: usize) -> Vec<u8> {
        assert!(total_len >= MIN_RECORD_SIZE);
        let mut buf = vec![0u8; total_len];
        buf[0..4].copy_from_slice(&(total_len as u32).to_le_bytes());
        buf[4..6].copy_from_slice(&(LogRecordKind::Skip as u16).to_le_bytes());
        buf[6] = CAT_SYSTEM;
        let body_len = total_len - LOG_HEADER_SIZE - LOG_TRAILER_SIZE;
        let crc = crc32fast::hash(&buf[LOG_HEADER_SIZE..LOG_HEADER_SIZE + body_len]);
        buf[total_len - 8..total_len - 4].copy_from_slice(&crc.to_le_bytes());
        buf[total_len - 4..total_len].copy_from_slice(&(total_len as u32).to_le_bytes());
        buf
    }

    /// Decode a record that starts at `bytes[0]`. `bytes` may extend past
    /// the record's end.
    pub fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        if bytes.len() < LOG_HEADER_SIZE {
            return Err(DbError::BadLogRec("truncated header".to_string()));
        }
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if len < MIN_RECORD_SIZE || len > bytes.len() {
            return Err(DbError::BadLogRec(format!("bad record length {}", len)));
        }
        let kind = LogRecordKind::from_u16(u16::from_le_bytes(bytes[4..6].try_into().unwrap()))?;
        let cat = bytes[6];
        let tid = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let prev_lsn = Lsn::from_u64(u64::from_le_bytes(bytes[16..24].try_into().unwrap()));
        let pid = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        let page2_pid = u32::from_le_bytes(bytes[28..32].try_into().unwrap());
        let page_prv = Lsn::from_u64(u64::from_le_bytes(bytes[32..40].try_into().unwrap()));
        let page2_prv = Lsn::from_u64(u64::from_le_bytes(bytes[40..48].try_into().unwrap()));

        let body = &bytes[LOG_HEADER_SIZE..len - LOG_TRAILER_SIZE];
        let stored_crc =
            u32::from_le_bytes(bytes[len - 8..len - 4].try_into().unwrap());
        if stored_crc != crc32fast::hash(body) {
            return Err(DbError::BadLogRec("payload checksum mismatch".to_string()));
        }
        let trailing_len = u32::from_le_bytes(bytes[len - 4..len].try_into().unwrap());
        if trailing_len as usize != len {
            return Err(DbError::BadLogRec("trailing length mismatch".to_string()));
        }

        let payload = LogPayload::decode_body(kind, body)?;
        Ok(Self {
            len: len as u32,
            cat,
            tid,
            prev_lsn,
            pid,
            page2_pid,
            page_prv,
            page2_prv,
            payload,
            lsn: Lsn::NULL,
        })
    }

    /// Apply this record's redo effect to the given page image. Redo is
    /// idempotent: the caller only invokes it when `self.lsn > page.lsn`,
    /// and a multi-page record is applied once per affected page.
    pub fn redo(&self, target_pid: PageID, page: &mut BTreePage) {
        debug_assert!(self.is_redo());
        match &self.payload {
            LogPayload::PageImgFormat { image } => {
                let img = image_from_bytes(image);
                *page = BTreePage::parse(&img).expect("bad page image in log");
            }
            LogPayload::UpdateEmlsn { child_pid, emlsn } => {
                if let Some(slot) = page.find_pid_slot(*child_pid) {
                    page.set_child_emlsn(slot, *emlsn);
                }
            }
            LogPayload::BtreeInsert { key, element, .. } => match page.search(key) {
                Ok(slot) => page.replace_ghost(slot, element.clone()),
                Err(_) => page.insert_leaf_item(key, false, element.clone()),
            },
            LogPayload::BtreeRemove { key, .. } => {
                if let Ok(slot) = page.search(key) {
                    page.mark_ghost(slot);
                }
            }
            LogPayload::BtreeUpdate {
                key, new_element, ..
            } => {
                if let Ok(slot) = page.search(key) {
                    page.set_element(slot, new_element.clone());
                }
            }
            LogPayload::BtreeOverwrite {
                key,
                offset,
                new_part,
                ..
            } => {
                if let Ok(slot) = page.search(key) {
                    let mut element = page.item(slot).element().to_vec();
                    let off = *offset as usize;
                    element[off..off + new_part.len()].copy_from_slice(new_part);
                    page.set_element(slot, element);
                }
            }
            LogPayload::BtreeGhostReserve { key, element_len } => {
                if page.search(key).is_err() {
                    page.insert_leaf_item(key, true, vec![0u8; *element_len as usize]);
                }
            }
            LogPayload::BtreeGhostReclaim { keys } => {
                for key in keys {
                    if let Ok(slot) = page.search(key) {
                        if page.item(slot).ghost {
                            page.remove_item_at(slot);
                        }
                    }
                }
            }
            LogPayload::BtreeNorecSplit {
                store,
                root,
                level,
                new_pid,
                split_key,
                fence_high,
                btflags_new,
                chain_fence_high,
                chain_supremum,
                foster,
                foster_emlsn,
            } => {
                if target_pid == *new_pid {
                    // virgin foster child
                    let mut flags = *btflags_new;
                    if *chain_supremum {
                        flags |= crate::btree::page::BT_CHAIN_HIGH_SUPREMUM;
                    }
                    let mut fresh = BTreePage::format(
                        *new_pid,
                        *store,
                        *root,
                        *level,
                        split_key.clone(),
                        fence_high.clone(),
                        flags,
                        chain_fence_high.clone(),
                    );
                    fresh.foster = *foster;
                    fresh.foster_emlsn = *foster_emlsn;
                    *page = fresh;
                } else {
                    // source page: key range shrinks to [low, split)
                    page.fence_high = split_key.clone();
                    page.btflags &= !crate::btree::page::BT_HIGH_SUPREMUM;
                    if *chain_supremum {
                        page.btflags |= crate::btree::page::BT_CHAIN_HIGH_SUPREMUM;
                    } else {
                        page.btflags &= !crate::btree::page::BT_CHAIN_HIGH_SUPREMUM;
                        page.chain_fence_high = chain_fence_high.clone();
                    }
                    page.foster = *new_pid;
                    page.foster_emlsn = Lsn::NULL;
                }
            }
            LogPayload::BtreeFosterRebalance { split_key, moved } => {
                if target_pid == self.pid {
                    // source: drop everything at or above the split key
                    while let Some(last) = page.nrecs().checked_sub(1) {
                        if page.key_at(last) >= *split_key {
                            page.remove_item_at(last);
                        } else {
                            break;
                        }
                    }
                } else {
                    for item in moved {
                        if page.search(&item.key).is_ok() {
                            continue;
                        }
                        match &item.body {
                            MovedBody::Leaf(element) => {
                                page.insert_leaf_item(&item.key, item.ghost, element.clone())
                            }
                            MovedBody::Interior(child, emlsn) => {
                                page.insert_interior_item(&item.key, *child, *emlsn)
                            }
                        }
                    }
                }
            }
            LogPayload::BtreeFosterAdopt {
                separator,
                new_child,
                new_child_emlsn,
            } => {
                if target_pid == self.pid {
                    // parent gains the separator
                    if page.search(separator).is_err() {
                        page.insert_interior_item(separator, *new_child, *new_child_emlsn);
                    }
                } else {
                    // former foster parent loses its foster pointer
                    page.foster = 0;
                    page.foster_emlsn = Lsn::NULL;
                    page.chain_fence_high = page.fence_high.clone();
                    if page.btflags & crate::btree::page::BT_HIGH_SUPREMUM != 0 {
                        page.btflags |= crate::btree::page::BT_CHAIN_HIGH_SUPREMUM;
                    }
                }
            }
            LogPayload::BtreeFosterDeadopt {
                separator,
                child_pid,
                child_emlsn,
            } => {
                if target_pid == self.pid {
                    if let Ok(slot) = page.search(separator) {
                        page.remove_item_at(slot);
                    }
                } else {
                    page.foster = *child_pid;
                    page.foster_emlsn = *child_emlsn;
                }
            }
            other => panic!("redo on non-redo payload {:?}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut rec = LogRecord::new(
            CAT_REDO | CAT_UNDO,
            LogPayload::BtreeInsert {
                store: 1,
                key: KeyStr::new(b"key001"),
                element: vec![7u8; 100],
            },
        );
        rec.tid = 42;
        rec.pid = 17;
        rec.prev_lsn = Lsn::new(1, 64);
        rec.page_prv = Lsn::new(1, 128);

        let bytes = rec.encode();
        assert_eq!(bytes.len(), rec.len as usize);

        let back = LogRecord::decode(&bytes).unwrap();
        assert_eq!(back.kind(), LogRecordKind::BtreeInsert);
        assert_eq!(back.tid, 42);
        assert_eq!(back.pid, 17);
        assert_eq!(back.prev_lsn, Lsn::new(1, 64));
        match back.payload {
            LogPayload::BtreeInsert { key, element, .. } => {
                assert_eq!(key, KeyStr::new(b"key001"));
                assert_eq!(element.len(), 100);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let rec = LogRecord::new(CAT_SYSTEM, LogPayload::Comment {
            text: "hello".to_string(),
        });
        let mut bytes = rec.encode();
        let off = LOG_HEADER_SIZE + 1;
        bytes[off] ^= 0xff;
        assert!(matches!(
            LogRecord::decode(&bytes),
            Err(DbError::BadLogRec(_))
        ));
    }
}
