use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, info};

use crate::{
    archive::{merger::RunMerger, ArchiveDir, LogArchiver},
    btree::{
        page::{BTreePage, BT_CHAIN_HIGH_SUPREMUM, BT_HIGH_SUPREMUM},
        BTree,
    },
    buffer::{cleaner::PageCleaner, evictioner::PageEvictioner, BufferPool},
    config::Options,
    error::{DbError, DbResult},
    keystr::KeyStr,
    latch::Timeout,
    lock::LockManager,
    lsn::Lsn,
    page_id::{PageID, StoreID},
    recovery::restart,
    restore::RestoreCoordinator,
    transaction::{logger::Logger, Transaction},
    vol::{alloc_cache::FIRST_DATA_PID, backup::BackupWriter, Volume},
    wal::{
        record::{LogPayload, LogRecord, CAT_SYSTEM},
        LogManager,
    },
};

/// The engine: one value owning every subsystem, initialised once and
/// passed by reference into every operation. Startup order is log,
/// archive, volume, buffer pool, lock manager, then restart and the
/// background daemons; shutdown tears down in reverse.
pub struct Database {
    opts: Options,
    log: Arc<LogManager>,
    archive: Arc<ArchiveDir>,
    archiver: Arc<LogArchiver>,
    merger: Option<Arc<RunMerger>>,
    vol: Arc<Volume>,
    bf: Arc<BufferPool>,
    lm: Arc<LockManager>,
    cleaner: Arc<PageCleaner>,
    evictioner: Arc<PageEvictioner>,

    next_tid: AtomicU64,
    active: Mutex<HashSet<u64>>,
    stopped: AtomicBool,
}

impl Database {
    pub fn new(opts: Options) -> Result<Database, DbError> {
        let log = LogManager::new(&opts)?;
        let archive = ArchiveDir::new(&opts)?;
        let vol = Arc::new(Volume::new(&opts, Arc::clone(&log))?);
        let bf = BufferPool::new(&opts, Arc::clone(&vol), Arc::clone(&log), Arc::clone(&archive));
        let lm = Arc::new(LockManager::new(&opts));
        let archiver = LogArchiver::new(Arc::clone(&log), Arc::clone(&archive), &opts);
        let merger = if opts.get_bool("sm_archiver_merging", false) {
            Some(RunMerger::new(Arc::clone(&archive), &opts))
        } else {
            None
        };
        let cleaner = PageCleaner::new(Arc::clone(&bf), Arc::clone(&archive), &opts);
        let evictioner = PageEvictioner::new(Arc::clone(&bf), &opts);
        bf.set_cleaner(Arc::clone(&cleaner));
        bf.set_evictioner(Arc::clone(&evictioner));

        let db = Database {
            opts,
            log,
            archive,
            archiver,
            merger,
            vol,
            bf,
            lm,
            cleaner,
            evictioner,
            next_tid: AtomicU64::new(1),
            active: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        };

        let outcome = restart::restart(&db)?;
        db.next_tid.store(outcome.max_tid + 1, Ordering::SeqCst);

        if db.opts.get_bool("sm_archiving", false) {
            db.archiver.start();
        }
        if let Some(merger) = &db.merger {
            merger.start();
        }
        db.cleaner.start();
        db.evictioner.start();

        let prefetch_partitions = db.opts.get_int("sm_log_fetch_buf_partitions", 0);
        if prefetch_partitions > 0 {
            let pages = prefetch_partitions as u32
                * (db.log.segment_size() / crate::page::PAGE_SIZE) as u32;
            db.bf.prefetch_pages(FIRST_DATA_PID, pages);
        }

        info!("database open");
        Ok(db)
    }

    // -- accessors -----------------------------------------------------

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.bf
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.vol
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lm
    }

    pub fn archive_dir(&self) -> &Arc<ArchiveDir> {
        &self.archive
    }

    pub fn archiver(&self) -> &Arc<LogArchiver> {
        &self.archiver
    }

    pub fn cleaner(&self) -> &Arc<PageCleaner> {
        &self.cleaner
    }

    // -- transactions --------------------------------------------------

    pub fn begin_tx(&self) -> Result<Transaction, DbError> {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        let timeout_ms = self.opts.get_int("sm_lock_timeout_ms", 0);
        let timeout = if timeout_ms > 0 {
            Timeout::Millis(timeout_ms as u64)
        } else {
            Timeout::Forever
        };
        let tx = Transaction::new(tid, timeout);
        Logger::log_xct(&self.log, &tx, LogPayload::XctBegin)?;
        self.active.lock().unwrap().insert(tid);
        Ok(tx)
    }

    pub(crate) fn forget_tx(&self, tid: u64) {
        self.active.lock().unwrap().remove(&tid);
    }

    pub(crate) fn active_tx_table(&self) -> Vec<(u64, Lsn)> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .map(|tid| (*tid, Lsn::NULL))
            .collect()
    }

    /// Commit a batch of transactions with one synthesised end record:
    /// either all of them become durable or none, after which each
    /// releases its locks individually. An empty group is a no-op.
    pub fn group_commit(&self, txs: &[&Transaction]) -> DbResult {
        if txs.is_empty() {
            return Ok(());
        }
        let tids: Vec<u64> = txs.iter().map(|t| t.tid()).collect();
        let rec = LogRecord::new(CAT_SYSTEM, LogPayload::XctEndGroup { tids });
        self.log.insert(&rec)?;
        self.log.flush(self.log.curr_lsn())?;
        for tx in txs {
            tx.end_group_commit(self);
        }
        debug!("group commit of {} transactions", txs.len());
        Ok(())
    }

    pub fn checkpoint(&self) -> DbResult {
        restart::take_checkpoint(self)
    }

    // -- stores --------------------------------------------------------

    /// Create a store with an empty B-tree root; the root's initial
    /// image goes to the log so recovery can always rebuild it.
    pub fn create_btree(&self) -> Result<BTree, DbError> {
        let (root_pid, store) = self.vol.create_store()?;
        let mut root = self.bf.fix_virgin(root_pid)?;
        *root.page_mut() = BTreePage::format(
            root_pid,
            store,
            root_pid,
            1,
            KeyStr::empty(),
            KeyStr::empty(),
            BT_HIGH_SUPREMUM | BT_CHAIN_HIGH_SUPREMUM,
            KeyStr::empty(),
        );
        let image = root.page().to_image().to_vec();
        Logger::log_page_ssx(&self.log, &mut root, LogPayload::PageImgFormat { image })?;
        debug!("btree created: store {}, root {}", store, root_pid);
        Ok(BTree::new(store, root_pid))
    }

    pub fn open_btree(&self, store: StoreID) -> Result<BTree, DbError> {
        let root_pid = self.vol.get_store_root(store).ok_or(DbError::NotFound)?;
        Ok(BTree::new(store, root_pid))
    }

    /// Verify every store of the volume.
    pub fn verify_volume(&self) -> Result<bool, DbError> {
        let mut consistent = true;
        for (store, _) in self.vol.all_stores() {
            consistent &= self.open_btree(store)?.verify(self)?;
        }
        Ok(consistent)
    }

    // -- backup & restore ----------------------------------------------

    /// Take a sharp backup: quiesce dirty pages, flush the log (and
    /// optionally the archive), then stream the volume into a new
    /// backup file registered under the current durable LSN.
    pub fn take_backup(&self, path: &str, flush_archive: bool) -> DbResult {
        self.vol.begin_backup()?;
        let r = self.do_take_backup(path, flush_archive);
        self.vol.end_backup();
        r
    }

    fn do_take_backup(&self, path: &str, flush_archive: bool) -> DbResult {
        if self.vol.is_failed() {
            return Err(DbError::VolFailed);
        }
        self.cleaner.clean_all()?;
        self.log.flush(Lsn::NULL)?;
        self.vol.write_caches()?;
        if flush_archive {
            self.archiver.archive_until(self.log.durable_lsn())?;
        }
        let backup_lsn = self.log.durable_lsn();

        let writer = BackupWriter::create(std::path::Path::new(path))?;
        let last = self.vol.get_last_allocated_pid();
        let mut img = crate::page::new_page_image();
        for pid in 0..=last {
            self.vol.read_page_for_backup(pid, &mut img)?;
            writer.write_page(pid, &img)?;
        }
        writer.finish()?;

        self.vol.sx_add_backup(path, backup_lsn, false)?;
        info!("backup taken at {} into {}", backup_lsn, path);
        Ok(())
    }

    /// Mark the volume failed: open the latest backup, stamp the
    /// failure LSN with a restore_begin record, make sure the archive
    /// covers everything up to it, and fork the restore coordinator.
    pub fn mark_volume_failed(&self) -> DbResult {
        if self.vol.is_failed() {
            return Err(DbError::VolFailed);
        }
        if self.vol.latest_backup().is_none() {
            return Err(DbError::BackupBusy);
        }

        let mut rec = LogRecord::new(
            CAT_SYSTEM,
            LogPayload::RestoreBegin {
                last_used_pid: self.vol.get_last_allocated_pid(),
            },
        );
        rec.pid = 0;
        let failure_lsn = self.log.insert(&rec)?;
        self.log.flush(Lsn::NULL)?;
        self.archiver.archive_until(self.log.durable_lsn())?;

        let coord = RestoreCoordinator::new(
            Arc::clone(&self.vol),
            Arc::clone(&self.log),
            Arc::clone(&self.archive),
            failure_lsn,
            &self.opts,
        );
        coord.start();
        self.vol.set_restore(coord);
        info!("volume marked failed at {}", failure_lsn);
        Ok(())
    }

    pub fn check_restore_finished(&self) -> bool {
        self.vol.check_restore_finished()
    }

    // -- lifecycle -----------------------------------------------------

    fn do_shutdown(&self, clean: bool) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.evictioner.stop();
        self.cleaner.stop();
        if let Some(merger) = &self.merger {
            merger.stop();
        }
        self.archiver.stop();
        if let Some(coord) = self.vol.restore_coordinator() {
            coord.join();
            self.vol.detach_restore();
        }
        self.bf.detach_daemons();
        if clean {
            let _ = self.cleaner.clean_all();
            let _ = self.log.flush(Lsn::NULL);
            let _ = self.vol.shutdown();
        }
        self.log.shutdown();
        info!("database closed (clean: {})", clean);
    }

    pub fn shutdown(self) {
        self.do_shutdown(true);
    }

    /// Tear down without cleaning the buffer pool or the caches, as a
    /// crash would; the next open goes through restart.
    pub fn simulate_crash(self) {
        self.do_shutdown(false);
    }

    /// The largest pid the engine would need to restore; exposed for
    /// tests and tools.
    pub fn last_used_pid(&self) -> PageID {
        self.vol.get_last_allocated_pid()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.do_shutdown(true);
    }
}
