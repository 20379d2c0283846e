pub mod cleaner;
pub mod control_block;
pub mod evictioner;
pub mod free_list;
pub mod hashtable;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    archive::ArchiveDir,
    btree::page::BTreePage,
    config::Options,
    error::{DbError, DbResult},
    latch::{Latch, LatchGuard, LatchMode, Timeout},
    wal::{
        record::{LogPayload, LogRecord, CAT_REDO, CAT_SSX, CAT_SYSTEM},
        LogManager,
    },
    lsn::Lsn,
    page::{new_page_image, PAGE_SIZE},
    page_id::{is_swizzled, swizzle, unswizzle, FrameIdx, PageID, StoreID},
    recovery::spr,
    stats::{Stats, STATS},
    utils::HandyRwLock,
    vol::Volume,
};

use self::{
    cleaner::PageCleaner,
    control_block::ControlBlock,
    evictioner::PageEvictioner,
    free_list::FreeList,
    hashtable::{HashEntry, PageTable},
};

/// How fix() behaves on a miss and afterwards.
#[derive(Copy, Clone)]
pub struct FixFlags {
    /// Do not wait for the latch; fail with `LatchInUse` instead.
    pub conditional: bool,
    /// The page is brand new: no read, no recovery, EX latch.
    pub virgin: bool,
    /// Give up with `NotFound` instead of doing IO.
    pub only_if_hit: bool,
    /// Run single-page recovery when the frame is behind `emlsn`.
    pub do_recovery: bool,
    pub emlsn: Lsn,
}

impl Default for FixFlags {
    fn default() -> Self {
        Self {
            conditional: false,
            virgin: false,
            only_if_hit: false,
            do_recovery: true,
            emlsn: Lsn::NULL,
        }
    }
}

pub struct Frame {
    pub cb: ControlBlock,
    pub latch: Latch<BTreePage>,
}

/// The buffer pool: a fixed array of page frames with lock-free control
/// blocks, a concurrent pid -> frame table, a free list, pointer
/// swizzling and fix-time single-page recovery.
pub struct BufferPool {
    frames: Vec<Frame>,
    table: PageTable,
    free: FreeList,

    vol: Arc<Volume>,
    log: Arc<LogManager>,
    archive: Arc<ArchiveDir>,

    enable_swizzling: bool,
    maintain_emlsn: bool,
    prioritize_archive: bool,
    async_eviction: bool,
    log_fetches: bool,
    gclock_k: u32,

    root_frames: RwLock<HashMap<StoreID, FrameIdx>>,
    /// Per-page recovery targets discovered by restart analysis; merged
    /// with the caller's EMLSN on fix.
    restart_emlsns: RwLock<HashMap<PageID, Lsn>>,

    evictioner: RwLock<Option<Arc<PageEvictioner>>>,
    cleaner: RwLock<Option<Arc<PageCleaner>>>,

    fix_cnt: AtomicU64,
    hit_cnt: AtomicU64,
    warmup_done: AtomicBool,
    warmup_hit_ratio: f64,
    warmup_min_fixes: u64,

    /// Free-list low-water mark that triggers eviction.
    evict_batch: usize,
}

impl BufferPool {
    pub fn new(
        opts: &Options,
        vol: Arc<Volume>,
        log: Arc<LogManager>,
        archive: Arc<ArchiveDir>,
    ) -> Arc<Self> {
        let pool_mib = opts.get_int("sm_bufpoolsize", 64) as usize;
        let block_cnt = std::cmp::max(8, pool_mib * (1 << 20) / PAGE_SIZE);

        let mut frames = Vec::with_capacity(block_cnt + 1);
        for _ in 0..=block_cnt {
            frames.push(Frame {
                cb: ControlBlock::new(),
                latch: Latch::new(BTreePage::empty()),
            });
        }

        let free = FreeList::new(opts.get_bool("sm_bf_free_list_high_contention", false), block_cnt);
        // frame 0 is the NULL frame and never handed out
        for idx in 1..=block_cnt {
            free.push(idx as FrameIdx);
        }

        let batch_ppm = opts.get_int("sm_evictioner_batch_ratio_ppm", 10_000) as usize;
        let evict_batch = std::cmp::max(1, block_cnt * batch_ppm / 1_000_000);

        info!("buffer pool with {} frames", block_cnt);
        Arc::new(Self {
            frames,
            table: PageTable::new(),
            free,
            vol,
            log,
            archive,
            enable_swizzling: opts.get_bool("sm_bufferpool_swizzle", false),
            maintain_emlsn: opts.get_bool("sm_bf_maintain_emlsn", true),
            prioritize_archive: opts.get_bool("sm_recovery_prioritize_archive", false),
            async_eviction: opts.get_bool("sm_async_eviction", false),
            log_fetches: opts.get_bool("sm_bf_log_fetches", false),
            gclock_k: opts.get_int("sm_evictioner_gclock_k", 10) as u32,
            root_frames: RwLock::new(HashMap::new()),
            restart_emlsns: RwLock::new(HashMap::new()),
            evictioner: RwLock::new(None),
            cleaner: RwLock::new(None),
            fix_cnt: AtomicU64::new(0),
            hit_cnt: AtomicU64::new(0),
            warmup_done: AtomicBool::new(false),
            warmup_hit_ratio: opts.get_float("sm_bf_warmup_hit_ratio", 0.9),
            warmup_min_fixes: opts.get_int("sm_bf_warmup_min_fixes", 1000) as u64,
            evict_batch,
        })
    }

    pub fn block_count(&self) -> usize {
        self.frames.len() - 1
    }

    pub(crate) fn frame(&self, idx: FrameIdx) -> &Frame {
        &self.frames[idx as usize]
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.vol
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn swizzling_enabled(&self) -> bool {
        self.enable_swizzling
    }

    pub fn set_evictioner(&self, ev: Arc<PageEvictioner>) {
        *self.evictioner.wl() = Some(ev);
    }

    pub fn set_cleaner(&self, cl: Arc<PageCleaner>) {
        *self.cleaner.wl() = Some(cl);
    }

    pub fn cleaner(&self) -> Option<Arc<PageCleaner>> {
        self.cleaner.rl().clone()
    }

    /// Drop the daemon handles at shutdown (they hold the pool through
    /// an Arc, so this breaks the cycle).
    pub fn detach_daemons(&self) {
        *self.evictioner.wl() = None;
        *self.cleaner.wl() = None;
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn set_restart_emlsns(&self, map: HashMap<PageID, Lsn>) {
        *self.restart_emlsns.wl() = map;
    }

    fn restart_emlsn(&self, pid: PageID) -> Lsn {
        self.restart_emlsns
            .rl()
            .get(&pid)
            .copied()
            .unwrap_or(Lsn::NULL)
    }

    // -- warmup --------------------------------------------------------

    fn note_fix(&self, hit: bool) {
        let fixes = self.fix_cnt.fetch_add(1, Ordering::Relaxed) + 1;
        if hit {
            self.hit_cnt.fetch_add(1, Ordering::Relaxed);
        }
        Stats::bump(&STATS.page_fixes);
        if hit {
            Stats::bump(&STATS.page_hits);
        }
        if !self.warmup_done.load(Ordering::Relaxed) && fixes >= self.warmup_min_fixes {
            let hits = self.hit_cnt.load(Ordering::Relaxed);
            if hits as f64 / fixes as f64 >= self.warmup_hit_ratio {
                self.warmup_done.store(true, Ordering::Relaxed);
                debug!("buffer pool warmup done after {} fixes", fixes);
            }
        }
    }

    pub fn is_warmup_done(&self) -> bool {
        self.warmup_done.load(Ordering::Relaxed)
    }

    /// Sequential prefetch of `[first, first+count)` into free frames;
    /// prefetched frames are marked `check_recovery` and recover on
    /// first fix.
    pub fn prefetch_pages(self: &Arc<Self>, first: PageID, count: u32) {
        for pid in first..first + count {
            if !self.vol.is_allocated_page(pid) {
                continue;
            }
            let mut flags = FixFlags::default();
            flags.do_recovery = false;
            match self.fix_nonroot(None, pid, LatchMode::Sh, flags) {
                Ok(guard) => {
                    guard.cb().set_check_recovery(true);
                }
                Err(e) => {
                    debug!("prefetch of page {} stopped: {}", pid, e);
                    break;
                }
            }
        }
    }

    // -- fix / unfix ---------------------------------------------------

    fn latch_timeout(conditional: bool) -> Timeout {
        if conditional {
            Timeout::Immediate
        } else {
            Timeout::Forever
        }
    }

    /// Fix a non-root page, given its (latched) parent when available.
    /// Handles swizzled pointers, hash lookup, miss IO (possibly through
    /// the restore coordinator) and fix-time recovery.
    pub fn fix_nonroot(
        self: &Arc<Self>,
        mut parent: Option<&mut PageGuard>,
        pid: PageID,
        mode: LatchMode,
        flags: FixFlags,
    ) -> Result<PageGuard, DbError> {
        if is_swizzled(pid) {
            let idx = unswizzle(pid);
            let frame = self.frame(idx);
            if !frame.cb.try_pin() {
                return Err(DbError::Corrupt(format!(
                    "swizzled pointer to free frame {}",
                    idx
                )));
            }
            let guard = match frame.latch.acquire(mode, Self::latch_timeout(flags.conditional)) {
                Ok(g) => g,
                Err(e) => {
                    frame.cb.unpin();
                    return Err(e);
                }
            };
            self.note_fix(true);
            frame.cb.set_referenced(true);
            frame.cb.set_ref_count(self.gclock_k);
            return Ok(PageGuard::new(Arc::clone(self), idx, guard));
        }

        loop {
            if let Some(entry) = self.table.lookup(pid) {
                let idx = entry.frame;
                let frame = self.frame(idx);
                if !frame.cb.try_pin() {
                    // frame is being evicted; retry the lookup
                    thread::yield_now();
                    continue;
                }
                if frame.cb.pid() != pid || !frame.cb.is_used() {
                    frame.cb.unpin();
                    continue;
                }
                let guard =
                    match frame.latch.acquire(mode, Self::latch_timeout(flags.conditional)) {
                        Ok(g) => g,
                        Err(e) => {
                            frame.cb.unpin();
                            return Err(e);
                        }
                    };
                self.note_fix(true);
                frame.cb.set_referenced(true);
                frame.cb.set_ref_count(self.gclock_k);
                if let Some(ev) = self.evictioner.rl().as_ref() {
                    ev.on_hit(idx);
                }

                let mut page_guard = PageGuard::new(Arc::clone(self), idx, guard);
                self.maybe_swizzle(&mut parent, pid, idx, &mut page_guard);
                self.maybe_recover(&mut page_guard, flags)?;
                return Ok(page_guard);
            }

            if flags.only_if_hit {
                return Err(DbError::NotFound);
            }

            // miss: claim a free frame, read (or format) the page.
            // When the free list is dry the parent latch is released for
            // the wait: eviction may need that latch for EMLSN updates
            // or unswizzling, and the victim pool may sit entirely under
            // this parent. The pid being fixed stays valid across the
            // gap; the loop re-routes through fences if the tree moved.
            let idx = match self.free.pop() {
                Some(idx) => idx,
                None => match parent.as_mut() {
                    Some(p) => {
                        let mode = p.mode();
                        p.unlatch_during(mode, || self.get_free_frame())?
                    }
                    None => self.get_free_frame()?,
                },
            };
            let frame = self.frame(idx);
            let mut latch = frame
                .latch
                .acquire(LatchMode::Ex, Timeout::Forever)
                .expect("free frame latch");

            let parsed = if flags.virgin {
                let mut page = BTreePage::empty();
                page.hdr.pid = pid;
                page
            } else {
                let mut img = new_page_image();
                match self.vol.read_page(pid, &mut img) {
                    Ok(()) => {}
                    Err(e) => {
                        drop(latch);
                        self.free.push(idx);
                        return Err(e);
                    }
                }
                if crate::page::is_zero_image(&img[..]) {
                    // allocated after the last write reached disk; the
                    // log chain rebuilds it from scratch
                    let mut page = BTreePage::empty();
                    page.hdr.pid = pid;
                    page
                } else {
                    match BTreePage::parse(&img) {
                        Ok(p) => p,
                        Err(e) => {
                            drop(latch);
                            self.free.push(idx);
                            return Err(e);
                        }
                    }
                }
            };

            let parent_idx = parent.as_ref().map(|p| p.idx()).unwrap_or(0);
            if !self.table.try_insert(
                pid,
                HashEntry {
                    frame: idx,
                    parent: parent_idx,
                },
            ) {
                // another thread won the race; give our frame back
                drop(latch);
                self.free.push(idx);
                continue;
            }

            frame.cb.init(pid);
            frame.cb.set_page_lsn(parsed.hdr.lsn);
            frame.cb.set_ref_count(self.gclock_k);
            *latch.get_mut() = parsed;

            self.note_fix(false);
            if self.log_fetches {
                let rec = LogRecord::new(
                    CAT_SYSTEM,
                    LogPayload::FetchPage { pid },
                );
                let _ = self.log.insert(&rec);
            }
            if let Some(ev) = self.evictioner.rl().as_ref() {
                ev.on_miss(pid, idx);
            }

            let mut page_guard = PageGuard::new(Arc::clone(self), idx, latch);
            if !flags.virgin {
                self.maybe_recover(&mut page_guard, flags)?;
            }
            if mode == LatchMode::Sh {
                page_guard.downgrade();
            }
            self.maybe_swizzle(&mut parent, pid, idx, &mut page_guard);
            self.maybe_wake_evictioner();
            return Ok(page_guard);
        }
    }

    /// Fix the root page of a store. The root frame is installed once
    /// and keeps a permanent pin for the life of the pool.
    pub fn fix_root(self: &Arc<Self>, store: StoreID, mode: LatchMode) -> Result<PageGuard, DbError> {
        let root_pid = self
            .vol
            .get_store_root(store)
            .ok_or(DbError::NotFound)?;

        if let Some(&idx) = self.root_frames.rl().get(&store) {
            let frame = self.frame(idx);
            frame.cb.pin();
            let guard = frame.latch.acquire(mode, Timeout::Forever)?;
            self.note_fix(true);
            return Ok(PageGuard::new(Arc::clone(self), idx, guard));
        }

        let guard = self.fix_nonroot(None, root_pid, mode, FixFlags::default())?;
        {
            let mut roots = self.root_frames.wl();
            if !roots.contains_key(&store) {
                // permanent pin
                self.frame(guard.idx()).cb.pin();
                roots.insert(store, guard.idx());
            }
        }
        Ok(guard)
    }

    /// Fix a brand-new page (just allocated); EX latch, no IO.
    pub fn fix_virgin(self: &Arc<Self>, pid: PageID) -> Result<PageGuard, DbError> {
        let mut flags = FixFlags::default();
        flags.virgin = true;
        flags.do_recovery = false;
        self.fix_nonroot(None, pid, LatchMode::Ex, flags)
    }

    pub fn is_root_frame(&self, idx: FrameIdx) -> bool {
        self.root_frames.rl().values().any(|&v| v == idx)
    }

    /// Add a pin so the page can be re-fixed by index later without a
    /// hash probe (the latch may be dropped in between).
    pub fn pin_for_refix(&self, guard: &PageGuard) -> FrameIdx {
        self.frame(guard.idx()).cb.pin();
        guard.idx()
    }

    pub fn unpin_for_refix(&self, idx: FrameIdx) {
        self.frame(idx).cb.unpin();
    }

    pub fn refix_direct(
        self: &Arc<Self>,
        idx: FrameIdx,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<PageGuard, DbError> {
        let frame = self.frame(idx);
        debug_assert!(frame.cb.pin_count() > 0);
        frame.cb.pin();
        match frame.latch.acquire(mode, Self::latch_timeout(conditional)) {
            Ok(guard) => {
                self.note_fix(true);
                Ok(PageGuard::new(Arc::clone(self), idx, guard))
            }
            Err(e) => {
                frame.cb.unpin();
                Err(e)
            }
        }
    }

    fn maybe_recover(&self, guard: &mut PageGuard, flags: FixFlags) -> DbResult {
        if !flags.do_recovery {
            return Ok(());
        }
        let pid = guard.pid();
        let emlsn = std::cmp::max(flags.emlsn, self.restart_emlsn(pid));
        let needs = guard.cb().check_recovery() || guard.page().hdr.lsn < emlsn;
        if !needs || emlsn.is_null() {
            guard.cb().set_check_recovery(false);
            return Ok(());
        }
        // recovery mutates the page: relatch in EX if the caller asked
        // for SH (the pin keeps the frame alive across the relatch)
        let was_sh = guard.mode() == LatchMode::Sh;
        if was_sh {
            guard.relatch(LatchMode::Ex);
        }
        {
            let frame = self.frame(guard.idx());
            let page = guard.page_mut_for_recovery();
            spr::recover_page(
                &self.log,
                &self.archive,
                self.prioritize_archive,
                pid,
                page,
                emlsn,
            )?;
            frame.cb.set_page_lsn(page.hdr.lsn);
            frame.cb.set_check_recovery(false);
        }
        if was_sh {
            guard.downgrade();
        }
        Ok(())
    }

    /// Replace the parent's stored child pointer with the frame index.
    /// Rewriting the parent needs its EX latch; an SH parent is upgraded
    /// conditionally and downgraded right after, and any contention just
    /// skips the swizzle. The swizzled frame takes an extra pin until it
    /// is unswizzled.
    fn maybe_swizzle(
        &self,
        parent: &mut Option<&mut PageGuard>,
        pid: PageID,
        idx: FrameIdx,
        _child: &mut PageGuard,
    ) {
        if !self.enable_swizzling {
            return;
        }
        let parent = match parent {
            Some(p) => p,
            None => return,
        };
        let frame = self.frame(idx);
        if frame.cb.is_swizzled() {
            return;
        }
        let upgraded = if parent.mode() == LatchMode::Sh {
            if parent.try_upgrade().is_err() {
                return;
            }
            true
        } else {
            false
        };
        // the slot is re-located under the EX latch, so a page that
        // changed across the upgrade is handled naturally
        if let Some(slot) = parent.page().find_pid_slot(pid) {
            parent.page_mut().set_child(slot, swizzle(idx));
            frame.cb.pin();
            frame.cb.set_swizzled(true);
            self.table.set_parent(pid, parent.idx());
        }
        if upgraded {
            parent.downgrade();
        }
    }

    /// Rewrite any swizzled child pointers in `page` back to disk pids.
    /// Used on copies about to be written out.
    pub fn convert_to_disk_page(&self, page: &mut BTreePage) {
        let resolve = |p: PageID, pool: &Self| -> PageID {
            if is_swizzled(p) {
                pool.frame(unswizzle(p)).cb.pid()
            } else {
                p
            }
        };
        page.pid0 = resolve(page.pid0, self);
        page.foster = resolve(page.foster, self);
        if !page.is_leaf() {
            for i in 0..page.nrecs() {
                let child = page.item(i).child();
                if is_swizzled(child) {
                    let disk = resolve(child, self);
                    page.set_child(crate::btree::page::ChildSlot::Slot(i), disk);
                }
            }
        }
    }

    /// Normalize and un-register every swizzled child pointer of a page
    /// that is about to move or change parents (splits, adoption, root
    /// growth). Unlike `convert_to_disk_page`, this mutates the resident
    /// page and releases the swizzle pins.
    pub(crate) fn deswizzle_page_children(&self, page: &mut BTreePage) {
        let mut fix = |p: PageID| -> PageID {
            if is_swizzled(p) {
                let idx = unswizzle(p);
                let frame = self.frame(idx);
                let disk = frame.cb.pid();
                if frame.cb.is_swizzled() {
                    frame.cb.set_swizzled(false);
                    frame.cb.unpin();
                }
                disk
            } else {
                p
            }
        };
        page.pid0 = fix(page.pid0);
        page.foster = fix(page.foster);
        if !page.is_leaf() {
            for i in 0..page.nrecs() {
                let child = page.item(i).child();
                if is_swizzled(child) {
                    let disk = fix(child);
                    page.set_child(crate::btree::page::ChildSlot::Slot(i), disk);
                }
            }
        }
    }

    /// Parent-pointer sidemap maintenance for structural operations.
    pub(crate) fn note_parent_change(&self, pid: PageID, parent: FrameIdx) {
        self.table.set_parent(pid, parent);
    }

    pub fn normalize_pid(&self, pid: PageID) -> PageID {
        if is_swizzled(pid) {
            self.frame(unswizzle(pid)).cb.pid()
        } else {
            pid
        }
    }

    // -- eviction support ---------------------------------------------

    fn get_free_frame(&self) -> Result<FrameIdx, DbError> {
        for attempt in 0..500 {
            if let Some(idx) = self.free.pop() {
                return Ok(idx);
            }
            self.request_eviction();
            if attempt > 10 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        warn!("no evictable frame found, buffer pool is full");
        Err(DbError::BfFull)
    }

    fn request_eviction(&self) {
        // dirty frames are only evictable once the cleaner wrote them
        if let Some(cl) = self.cleaner.rl().clone() {
            cl.wakeup();
        }
        let ev = self.evictioner.rl().clone();
        if let Some(ev) = ev {
            if self.async_eviction {
                ev.wakeup();
            } else {
                ev.evict_batch();
            }
        }
    }

    fn maybe_wake_evictioner(&self) {
        if self.free.len() < self.evict_batch {
            let ev = self.evictioner.rl().clone();
            if let Some(ev) = ev {
                ev.wakeup();
            }
        }
    }

    /// Unswizzle the victim's pointer in its parent and refresh the
    /// parent's EMLSN. Returns false (abandon the victim) when the
    /// parent cannot be EX-latched without waiting or cannot be found.
    ///
    /// The victim frame is EX-latched by the caller and not yet frozen:
    /// a swizzled victim still carries its swizzle pin, which is dropped
    /// here once the parent pointer is rewritten.
    pub(crate) fn unswizzle_and_update_emlsn(&self, idx: FrameIdx, page_lsn: Lsn) -> bool {
        let frame = self.frame(idx);
        let pid = frame.cb.pid();
        // a clean, unswizzled victim can always go: its disk copy is
        // current, so a stale parent EMLSN is merely conservative
        let evictable_without_parent = !frame.cb.is_swizzled() && !frame.cb.is_dirty();
        let entry = match self.table.lookup(pid) {
            Some(e) => e,
            None => return evictable_without_parent,
        };
        if entry.parent == 0 {
            return evictable_without_parent;
        }
        let parent = self.frame(entry.parent);
        if !parent.cb.try_pin() {
            return evictable_without_parent;
        }
        let result = (|| {
            let mut pguard = match parent.latch.acquire(LatchMode::Ex, Timeout::Immediate) {
                Ok(g) => g,
                Err(_) => return evictable_without_parent,
            };
            if !parent.cb.is_used() {
                return false;
            }
            let swizzled_ref = swizzle(idx);
            let slot = pguard
                .get()
                .find_pid_slot(swizzled_ref)
                .or_else(|| pguard.get().find_pid_slot(pid));
            let slot = match slot {
                Some(s) => s,
                None => return !frame.cb.is_swizzled(),
            };
            let (stored, emlsn) = pguard.get().child_at(slot);
            if stored == swizzled_ref {
                pguard.get_mut().set_child(slot, pid);
                frame.cb.set_swizzled(false);
                frame.cb.unpin(); // the swizzle pin
            }
            if self.maintain_emlsn && emlsn < page_lsn {
                let mut rec = LogRecord::new(
                    CAT_REDO | CAT_SSX,
                    LogPayload::UpdateEmlsn {
                        child_pid: pid,
                        emlsn: page_lsn,
                    },
                );
                rec.pid = parent.cb.pid();
                rec.page_prv = parent.cb.page_lsn();
                match self.log.insert(&rec) {
                    Ok(lsn) => {
                        pguard.get_mut().set_child_emlsn(slot, page_lsn);
                        pguard.get_mut().hdr.lsn = lsn;
                        parent.cb.set_page_lsn(lsn);
                        parent.cb.mark_dirty(lsn);
                    }
                    Err(e) => {
                        warn!("emlsn update failed: {}", e);
                        return false;
                    }
                }
            }
            true
        })();
        parent.cb.unpin();
        result
    }

    /// Remove the frame from the table and free it. The caller holds the
    /// EX latch and has already frozen the pin count.
    pub(crate) fn release_frame(&self, idx: FrameIdx) {
        let frame = self.frame(idx);
        let pid = frame.cb.pid();
        self.table.remove(pid);
        frame.cb.clear();
        self.free.push(idx);
        Stats::bump(&STATS.evictions);
    }

    // -- introspection -------------------------------------------------

    pub fn has_dirty_frames(&self) -> bool {
        (1..self.frames.len()).any(|i| {
            let cb = &self.frames[i].cb;
            cb.is_used() && cb.is_dirty()
        })
    }

    /// (pid, rec_lsn) of every dirty frame, for checkpoints.
    pub fn dirty_page_table(&self) -> Vec<(PageID, Lsn)> {
        (1..self.frames.len())
            .filter_map(|i| {
                let cb = &self.frames[i].cb;
                if cb.is_used() && cb.is_dirty() {
                    Some((cb.pid(), cb.rec_lsn()))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn min_rec_lsn(&self) -> Lsn {
        self.dirty_page_table()
            .into_iter()
            .map(|(_, l)| l)
            .filter(|l| !l.is_null())
            .min()
            .unwrap_or(Lsn::NULL)
    }

    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        for i in 1..self.frames.len() {
            let cb = &self.frames[i].cb;
            if cb.is_used() {
                out.push_str(&format!(
                    "frame {}: pid {} pin {} dirty {} lsn {}\n",
                    i,
                    cb.pid(),
                    cb.pin_count(),
                    cb.is_dirty(),
                    cb.page_lsn()
                ));
            }
        }
        out
    }
}

/// A fixed page: pin + latch, released together on drop.
pub struct PageGuard {
    pool: Arc<BufferPool>,
    idx: FrameIdx,
    guard: Option<LatchGuard<BTreePage>>,
}

impl PageGuard {
    fn new(pool: Arc<BufferPool>, idx: FrameIdx, guard: LatchGuard<BTreePage>) -> Self {
        Self {
            pool,
            idx,
            guard: Some(guard),
        }
    }

    pub fn idx(&self) -> FrameIdx {
        self.idx
    }

    pub fn pid(&self) -> PageID {
        self.pool.frame(self.idx).cb.pid()
    }

    pub fn cb(&self) -> &ControlBlock {
        &self.pool.frame(self.idx).cb
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn mode(&self) -> LatchMode {
        self.guard.as_ref().unwrap().mode()
    }

    pub fn page(&self) -> &BTreePage {
        self.guard.as_ref().unwrap().get()
    }

    /// Mutable page access; requires the EX latch.
    pub fn page_mut(&mut self) -> &mut BTreePage {
        self.guard.as_mut().unwrap().get_mut()
    }

    fn page_mut_for_recovery(&mut self) -> &mut BTreePage {
        self.page_mut()
    }

    /// Conditional SH -> EX upgrade; see `LatchGuard::try_upgrade` for
    /// the revalidation caveat.
    pub fn try_upgrade(&mut self) -> DbResult {
        self.guard.as_mut().unwrap().try_upgrade()
    }

    pub fn downgrade(&mut self) {
        self.guard.as_mut().unwrap().downgrade();
    }

    /// Stamp a freshly logged update: page LSN, control block, dirty
    /// bit, log-volume counter.
    pub fn update_page_lsn(&mut self, lsn: Lsn, record_len: u32) {
        self.page_mut().hdr.lsn = lsn;
        let cb = &self.pool.frame(self.idx).cb;
        cb.set_page_lsn(lsn);
        cb.mark_dirty(lsn);
        cb.add_log_volume(record_len);
    }

    /// Drop the latch (keeping the pin), run `f`, re-latch in `mode`.
    /// Used to block on a lock without holding the latch; the page may
    /// have changed across the gap, so the caller revalidates.
    pub fn unlatch_during<F, R>(&mut self, mode: LatchMode, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.guard.take();
        let r = f();
        let guard = self
            .pool
            .frame(self.idx)
            .latch
            .acquire(mode, Timeout::Forever)
            .expect("unconditional latch");
        self.guard = Some(guard);
        r
    }

    /// Release latch and pin, then re-acquire the latch in `mode`. The
    /// pin keeps the frame resident; the page may have changed, so the
    /// caller revalidates.
    pub fn relatch(&mut self, mode: LatchMode) {
        self.guard.take();
        let guard = self
            .pool
            .frame(self.idx)
            .latch
            .acquire(mode, Timeout::Forever)
            .expect("unconditional latch");
        self.guard = Some(guard);
    }

    /// Drop the fix, hinting the evictioner that this page is cold.
    pub fn unfix_evict(self) {
        self.cb().set_referenced(false);
        self.cb().set_ref_count(0);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        // release the latch before the pin
        self.guard.take();
        self.pool.frame(self.idx).cb.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{archive::ArchiveDir, config::Options, vol::Volume, wal::LogManager};

    fn pool_fixture(dir: &tempfile::TempDir) -> Arc<BufferPool> {
        let mut opts = Options::new();
        opts.set_string("sm_logdir", dir.path().join("log").to_str().unwrap())
            .set_string("sm_archdir", dir.path().join("arch").to_str().unwrap())
            .set_string("sm_dbfile", dir.path().join("db").to_str().unwrap())
            .set_int("sm_bufpoolsize", 0); // clamped to the 8-frame floor
        let log = LogManager::new(&opts).unwrap();
        let archive = ArchiveDir::new(&opts).unwrap();
        let vol = Arc::new(Volume::new(&opts, Arc::clone(&log)).unwrap());
        BufferPool::new(&opts, vol, log, archive)
    }

    #[test]
    fn test_bf_full_when_every_frame_is_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_fixture(&dir);
        assert_eq!(pool.block_count(), 8);

        let mut guards = Vec::new();
        for _ in 0..8 {
            let pid = pool.volume().alloc_a_page(1).unwrap();
            guards.push(pool.fix_virgin(pid).unwrap());
        }
        // no free frame and no victim: the ninth fix fails
        let pid = pool.volume().alloc_a_page(1).unwrap();
        assert!(matches!(pool.fix_virgin(pid), Err(DbError::BfFull)));

        // after the caller lets go, fixing works again
        guards.clear();
        assert!(pool.fix_virgin(pid).is_ok());
    }

    #[test]
    fn test_pin_for_refix_outlives_the_latch() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_fixture(&dir);
        let pid = pool.volume().alloc_a_page(1).unwrap();
        let guard = pool.fix_virgin(pid).unwrap();
        let idx = pool.pin_for_refix(&guard);
        drop(guard);

        let again = pool.refix_direct(idx, LatchMode::Sh, false).unwrap();
        assert_eq!(again.pid(), pid);
        drop(again);
        pool.unpin_for_refix(idx);
    }
}
