pub mod alloc_cache;
pub mod backup;
pub mod stnode_cache;

use std::{
    convert::TryInto,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use log::{debug, info};

use crate::{
    error::{DbError, DbResult},
    io::DbFile,
    wal::{
        record::{LogPayload, LogRecord, CAT_REDO, CAT_SSX, CAT_SYSTEM},
        LogManager,
    },
    lsn::Lsn,
    page::{new_page_image, seal_image, verify_image, PageImage, PAGE_SIZE},
    page_id::{PageID, StoreID},
    restore::RestoreCoordinator,
    stats::{Stats, STATS},
    utils::HandyRwLock,
};

use self::{
    alloc_cache::{alloc_page_pid, AllocCache, EXTENT_SIZE},
    backup::{BackupFile, BackupReader},
    stnode_cache::{StnodeCache, STNODE_PID},
};

const VOL_MAGIC: u32 = 0x5a56_4f4c; // "ZVOL"

/// File-backed page store with transactional allocation caches, backup
/// bookkeeping and the failed-volume hook that routes reads through the
/// restore coordinator.
pub struct Volume {
    file: DbFile,
    path: PathBuf,
    log: Arc<LogManager>,

    readonly: bool,
    no_db: bool,
    log_reads: bool,
    log_writes: bool,
    cluster_stores: bool,
    read_latency: Duration,
    write_latency: Duration,

    alloc: RwLock<AllocCache>,
    stnode: RwLock<StnodeCache>,

    backups: RwLock<Vec<BackupFile>>,
    backup_in_progress: AtomicBool,

    failed: AtomicBool,
    restore: RwLock<Option<Arc<RestoreCoordinator>>>,
}

impl Volume {
    pub fn new(opts: &crate::config::Options, log: Arc<LogManager>) -> Result<Self, DbError> {
        let path = PathBuf::from(opts.get_string("sm_dbfile", "db"));
        let format = opts.get_bool("sm_format", false) || !path.exists();
        let file = DbFile::open(&path)?;

        let vol = Self {
            file,
            path,
            log,
            readonly: opts.get_bool("sm_vol_readonly", false),
            no_db: opts.get_bool("sm_no_db", false),
            log_reads: opts.get_bool("sm_vol_log_reads", false),
            log_writes: opts.get_bool("sm_vol_log_writes", false),
            cluster_stores: opts.get_bool("sm_vol_cluster_stores", true),
            read_latency: Duration::from_micros(
                opts.get_int("sm_vol_simulate_read_latency", 0) as u64
            ),
            write_latency: Duration::from_micros(
                opts.get_int("sm_vol_simulate_write_latency", 0) as u64,
            ),
            alloc: RwLock::new(AllocCache::new()),
            stnode: RwLock::new(StnodeCache::new()),
            backups: RwLock::new(Vec::new()),
            backup_in_progress: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            restore: RwLock::new(None),
        };

        if format {
            vol.format()?;
            let rec = LogRecord::new(CAT_SYSTEM, LogPayload::FormatVolume);
            vol.log.insert(&rec)?;
            info!("volume formatted at {:?}", vol.path);
        } else {
            vol.build_caches()?;
            debug!(
                "volume opened, last allocated pid {}",
                vol.alloc.rl().last_allocated_pid()
            );
        }
        Ok(vol)
    }

    fn format(&self) -> DbResult {
        self.file.set_len(0)?;
        // header page
        let mut img = new_page_image();
        img[4..8].copy_from_slice(&VOL_MAGIC.to_le_bytes());
        img[8..12].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        seal_image(&mut img[..]);
        self.file.write_at(0, &img[..])?;
        self.write_caches()?;
        self.file.sync()
    }

    /// Load the alloc and stnode caches from their on-disk pages.
    fn build_caches(&self) -> DbResult {
        let mut hdr = new_page_image();
        self.file.read_at_short(0, &mut hdr[..])?;
        let magic = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
        if magic != VOL_MAGIC {
            return Err(DbError::Corrupt(format!(
                "bad volume magic {:08x}",
                magic
            )));
        }

        let mut stnode_img = new_page_image();
        self.file
            .read_at_short(STNODE_PID as u64 * PAGE_SIZE as u64, &mut stnode_img[..])?;
        *self.stnode.wl() = StnodeCache::from_image(&stnode_img)?;

        // bitmap pages: extents exist up to the file length
        let file_pages = (self.file.len()? + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
        let extents = (file_pages as u32 + EXTENT_SIZE - 1) / EXTENT_SIZE;
        let mut images = Vec::new();
        for extent in 0..extents.max(1) {
            let pid = alloc_page_pid(extent);
            let mut img = new_page_image();
            self.file
                .read_at_short(pid as u64 * PAGE_SIZE as u64, &mut img[..])?;
            images.push((extent, img));
        }
        *self.alloc.wl() = AllocCache::from_images(&images)?;
        Ok(())
    }

    /// Persist the caches; called on clean shutdown and after format.
    pub fn write_caches(&self) -> DbResult {
        if self.readonly || self.no_db {
            return Ok(());
        }
        let durable = self.log.durable_lsn();
        {
            let mut alloc = self.alloc.wl();
            alloc.lsn = durable;
            for (pid, img) in alloc.to_images() {
                self.file
                    .write_at(pid as u64 * PAGE_SIZE as u64, &img[..])?;
            }
        }
        {
            let mut stnode = self.stnode.wl();
            stnode.lsn = durable;
            let img = stnode.to_image();
            self.file
                .write_at(STNODE_PID as u64 * PAGE_SIZE as u64, &img[..])?;
        }
        self.file.sync()
    }

    fn log_sys(&self, payload: LogPayload) -> Result<Lsn, DbError> {
        let rec = LogRecord::new(CAT_SYSTEM | CAT_REDO | CAT_SSX, payload);
        self.log.insert(&rec)
    }

    // -- page IO -------------------------------------------------------

    /// Read one page. On a failed volume the read is routed through the
    /// restore coordinator: either the restored image is delivered
    /// directly into `img`, or the segment is already restored and the
    /// regular read proceeds.
    pub fn read_page(&self, pid: PageID, img: &mut PageImage) -> DbResult {
        if self.is_failed() {
            let coord = self.restore.rl().clone();
            match coord {
                Some(coord) => {
                    if coord.request_restore(pid, img)? {
                        return Ok(());
                    }
                }
                None => return Err(DbError::VolFailed),
            }
        }
        self.read_page_internal(pid, img)
    }

    fn read_page_internal(&self, pid: PageID, img: &mut PageImage) -> DbResult {
        if !self.read_latency.is_zero() {
            std::thread::sleep(self.read_latency);
        }
        self.file
            .read_at_short(pid as u64 * PAGE_SIZE as u64, &mut img[..])?;
        if !verify_image(&img[..]) {
            return Err(DbError::Corrupt(format!("checksum mismatch on page {}", pid)));
        }
        Stats::bump(&STATS.page_reads);
        if self.log_reads {
            self.log_sys(LogPayload::PageRead {
                first_pid: pid,
                count: 1,
            })?;
        }
        Ok(())
    }

    /// Direct read used while streaming a backup; never routed through
    /// the restore coordinator.
    pub(crate) fn read_page_for_backup(&self, pid: PageID, img: &mut PageImage) -> DbResult {
        self.read_page_internal(pid, img)
    }

    pub fn read_many_pages(&self, first: PageID, out: &mut [PageImage]) -> DbResult {
        for (i, img) in out.iter_mut().enumerate() {
            self.read_page_internal(first + i as u32, img)?;
        }
        Ok(())
    }

    /// Contiguous page write. A no-op in read-only and no-db modes;
    /// refused while the volume is failed unless the restore coordinator
    /// itself is writing (`ignore_restore`).
    pub fn write_many_pages(
        &self,
        first: PageID,
        images: &[PageImage],
        ignore_restore: bool,
    ) -> DbResult {
        if self.readonly || self.no_db {
            return Ok(());
        }
        if self.is_failed() && !ignore_restore {
            return Err(DbError::VolFailed);
        }
        if !self.write_latency.is_zero() {
            std::thread::sleep(self.write_latency);
        }
        let mut buf = Vec::with_capacity(images.len() * PAGE_SIZE);
        for img in images {
            buf.extend_from_slice(&img[..]);
        }
        self.file
            .write_at(first as u64 * PAGE_SIZE as u64, &buf)?;
        Stats::add(&STATS.page_writes, images.len() as u64);
        if self.log_writes {
            self.log_sys(LogPayload::PageWrite {
                first_pid: first,
                clean_lsn: self.log.durable_lsn(),
                count: images.len() as u32,
            })?;
        }
        Ok(())
    }

    pub fn sync(&self) -> DbResult {
        self.file.sync()
    }

    // -- allocation ----------------------------------------------------

    pub fn alloc_a_page(&self, store: StoreID) -> Result<PageID, DbError> {
        let pid = self.alloc.wl().allocate(store, self.cluster_stores);
        let lsn = self.log_sys(LogPayload::AllocPage { pid, store })?;
        self.alloc.wl().lsn = lsn;
        Ok(pid)
    }

    pub fn deallocate_page(&self, pid: PageID) -> DbResult {
        let lsn = self.log_sys(LogPayload::DeallocPage { pid })?;
        let mut alloc = self.alloc.wl();
        alloc.apply_dealloc(pid);
        alloc.lsn = lsn;
        Ok(())
    }

    pub fn is_allocated_page(&self, pid: PageID) -> bool {
        self.alloc.rl().is_allocated(pid)
    }

    pub fn get_last_allocated_pid(&self) -> PageID {
        self.alloc.rl().last_allocated_pid()
    }

    pub fn num_used_pages(&self) -> usize {
        self.alloc.rl().used_page_count()
    }

    // -- stores --------------------------------------------------------

    /// Allocate a root page and register a new store.
    pub fn create_store(&self) -> Result<(PageID, StoreID), DbError> {
        let root_pid = self.alloc_a_page(0)?;
        let snum = self.stnode.wl().create_store(root_pid)?;
        let lsn = self.log_sys(LogPayload::CreateStore { root_pid, snum })?;
        self.stnode.wl().lsn = lsn;
        debug!("store {} created with root {}", snum, root_pid);
        Ok((root_pid, snum))
    }

    pub fn get_store_root(&self, snum: StoreID) -> Option<PageID> {
        self.stnode.rl().get_root_pid(snum)
    }

    pub fn is_alloc_store(&self, snum: StoreID) -> bool {
        self.stnode.rl().is_allocated(snum)
    }

    pub fn all_stores(&self) -> Vec<(StoreID, PageID)> {
        self.stnode.rl().all_stores()
    }

    // -- restart redo --------------------------------------------------

    /// Replay an allocation/store system record against the caches; used
    /// by restart for records newer than the persisted cache pages.
    pub fn redo_cache_record(&self, rec: &LogRecord) {
        match &rec.payload {
            LogPayload::AllocPage { pid, .. } => {
                let mut alloc = self.alloc.wl();
                if rec.lsn > alloc.lsn {
                    alloc.apply_alloc(*pid);
                }
            }
            LogPayload::DeallocPage { pid } => {
                let mut alloc = self.alloc.wl();
                if rec.lsn > alloc.lsn {
                    alloc.apply_dealloc(*pid);
                }
            }
            LogPayload::CreateStore { root_pid, snum } => {
                let mut stnode = self.stnode.wl();
                if rec.lsn > stnode.lsn {
                    stnode.apply_create_store(*snum, *root_pid);
                }
            }
            LogPayload::AddBackup { path, backup_lsn } => {
                self.backups.wl().push(BackupFile {
                    path: PathBuf::from(path),
                    backup_lsn: *backup_lsn,
                });
            }
            _ => {}
        }
    }

    // -- backups & failure ---------------------------------------------

    /// Register a backup file; `redo` skips the log record (restart).
    pub fn sx_add_backup(&self, path: &str, backup_lsn: Lsn, redo: bool) -> DbResult {
        if !redo {
            self.log_sys(LogPayload::AddBackup {
                path: path.to_string(),
                backup_lsn,
            })?;
        }
        self.backups.wl().push(BackupFile {
            path: PathBuf::from(path),
            backup_lsn,
        });
        Ok(())
    }

    pub fn latest_backup(&self) -> Option<BackupFile> {
        self.backups.rl().last().cloned()
    }

    pub fn num_backups(&self) -> usize {
        self.backups.rl().len()
    }

    pub fn open_latest_backup(&self) -> Result<BackupReader, DbError> {
        let meta = self
            .latest_backup()
            .ok_or_else(|| DbError::Corrupt("no backup registered".to_string()))?;
        BackupReader::open(&meta.path, meta.backup_lsn)
    }

    pub fn begin_backup(&self) -> DbResult {
        if self
            .backup_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DbError::BackupBusy);
        }
        Ok(())
    }

    pub fn end_backup(&self) {
        self.backup_in_progress.store(false, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn set_restore(&self, coord: Arc<RestoreCoordinator>) {
        *self.restore.wl() = Some(coord);
        self.failed.store(true, Ordering::Release);
    }

    pub fn restore_coordinator(&self) -> Option<Arc<RestoreCoordinator>> {
        self.restore.rl().clone()
    }

    /// Latched state transition out of restore: once every segment is
    /// restored and no waiters remain, the coordinator is joined and the
    /// failed flag clears.
    pub fn check_restore_finished(&self) -> bool {
        let coord = {
            let guard = self.restore.rl();
            match guard.as_ref() {
                Some(c) => {
                    if !c.is_done() {
                        return false;
                    }
                    Arc::clone(c)
                }
                None => return !self.is_failed(),
            }
        };
        coord.join();
        *self.restore.wl() = None;
        self.failed.store(false, Ordering::Release);
        info!("restore finished, volume back online");
        true
    }

    /// Forget the coordinator at shutdown without declaring the volume
    /// healthy (it holds an Arc back to the volume).
    pub(crate) fn detach_restore(&self) {
        *self.restore.wl() = None;
    }

    pub fn shutdown(&self) -> DbResult {
        self.write_caches()
    }
}
