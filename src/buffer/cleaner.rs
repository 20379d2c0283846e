use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::{
    archive::ArchiveDir,
    config::Options,
    error::DbResult,
    latch::{LatchMode, Timeout},
    wal::record::{LogPayload, LogRecord, CAT_SYSTEM},
    lsn::Lsn,
    page_id::{FrameIdx, PageID},
    stats::{Stats, STATS},
};

use super::BufferPool;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CleanerPolicy {
    OldestLsn,
    HighestRefCount,
    LowestRefCount,
    Mixed,
}

impl CleanerPolicy {
    pub fn from_str(s: &str) -> Self {
        match s {
            "highest_refcount" => CleanerPolicy::HighestRefCount,
            "lowest_refcount" => CleanerPolicy::LowestRefCount,
            "mixed" => CleanerPolicy::Mixed,
            _ => CleanerPolicy::OldestLsn,
        }
    }
}

struct Candidate {
    pid: PageID,
    idx: FrameIdx,
    rec_lsn: Lsn,
    ref_count: u32,
}

/// Background page cleaner: collects dirty candidates under a policy,
/// clusters them by pid for sequential writes, copies under SH latches,
/// honours WAL, and marks frames clean afterwards.
pub struct PageCleaner {
    pool: Arc<BufferPool>,
    archive: Arc<ArchiveDir>,

    interval_ms: u64,
    num_candidates: usize,
    /// Bytes of page copies staged per round; a second cap on the
    /// candidate count next to `num_candidates`.
    workspace_size: usize,
    policy: CleanerPolicy,
    min_write_size: usize,
    min_write_ignore_freq: u64,
    /// Decoupled mode: only clean what the archiver has already covered,
    /// so cleaner and archiver make joint progress.
    decoupled: bool,

    rounds: AtomicU64,
    wake: (Mutex<bool>, Condvar),
    shutdown: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PageCleaner {
    pub fn new(pool: Arc<BufferPool>, archive: Arc<ArchiveDir>, opts: &Options) -> Arc<Self> {
        Arc::new(Self {
            pool,
            archive,
            interval_ms: opts.get_int("sm_cleaner_interval", 100) as u64,
            num_candidates: opts.get_int("sm_cleaner_num_candidates", 64) as usize,
            workspace_size: opts.get_int("sm_cleaner_workspace_size", 1 << 20) as usize,
            policy: CleanerPolicy::from_str(&opts.get_string("sm_cleaner_policy", "oldest_lsn")),
            min_write_size: opts.get_int("sm_cleaner_min_write_size", 1) as usize,
            min_write_ignore_freq: opts.get_int("sm_cleaner_min_write_ignore_freq", 8) as u64,
            decoupled: opts.get_bool("sm_cleaner_decoupled", false),
            rounds: AtomicU64::new(0),
            wake: (Mutex::new(false), Condvar::new()),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("page-cleaner".to_string())
            .spawn(move || me.main_loop())
            .expect("spawn cleaner");
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn wakeup(&self) {
        let (lock, cv) = &self.wake;
        *lock.lock().unwrap() = true;
        cv.notify_one();
    }

    fn main_loop(self: Arc<Self>) {
        debug!("page cleaner started");
        while !self.shutdown.load(Ordering::Acquire) {
            {
                let (lock, cv) = &self.wake;
                let mut pending = lock.lock().unwrap();
                if !*pending {
                    let (g, _) = cv
                        .wait_timeout(pending, Duration::from_millis(self.interval_ms))
                        .unwrap();
                    pending = g;
                }
                *pending = false;
            }
            if let Err(e) = self.clean_pass(false) {
                warn!("cleaner pass failed: {}", e);
            }
        }
        debug!("page cleaner stopped");
    }

    fn collect_candidates(&self, exhaustive: bool) -> Vec<Candidate> {
        let archived = if self.decoupled && !exhaustive {
            self.archive.last_archived_lsn()
        } else {
            Lsn::NULL
        };
        let mut out = Vec::new();
        for idx in 1..=self.pool.block_count() {
            let cb = &self.pool.frame(idx as FrameIdx).cb;
            if !cb.is_used() || !cb.is_dirty() {
                continue;
            }
            if self.decoupled && !exhaustive && cb.rec_lsn() >= archived {
                continue;
            }
            out.push(Candidate {
                pid: cb.pid(),
                idx: idx as FrameIdx,
                rec_lsn: cb.rec_lsn(),
                ref_count: cb.ref_count(),
            });
        }

        if !exhaustive {
            let round = self.rounds.load(Ordering::Relaxed);
            let policy = match self.policy {
                CleanerPolicy::Mixed => match round % 3 {
                    0 => CleanerPolicy::OldestLsn,
                    1 => CleanerPolicy::HighestRefCount,
                    _ => CleanerPolicy::LowestRefCount,
                },
                p => p,
            };
            match policy {
                CleanerPolicy::OldestLsn => out.sort_by_key(|c| c.rec_lsn),
                CleanerPolicy::HighestRefCount => {
                    out.sort_by_key(|c| std::cmp::Reverse(c.ref_count))
                }
                CleanerPolicy::LowestRefCount => out.sort_by_key(|c| c.ref_count),
                CleanerPolicy::Mixed => unreachable!(),
            }
            let workspace_pages =
                std::cmp::max(1, self.workspace_size / crate::page::PAGE_SIZE);
            out.truncate(std::cmp::min(self.num_candidates, workspace_pages));
        }

        // cluster for sequential writes
        out.sort_by_key(|c| c.pid);
        out
    }

    /// One cleaning round. `exhaustive` ignores the candidate bound, the
    /// cluster-size filter and the decoupled watermark (used by
    /// shutdown and backup).
    pub fn clean_pass(&self, exhaustive: bool) -> DbResult {
        if self.pool.volume().is_failed() {
            // dirty pages of a failed volume stay put during restore
            return Ok(());
        }
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        Stats::bump(&STATS.cleaner_rounds);

        let candidates = self.collect_candidates(exhaustive);
        if candidates.is_empty() {
            return Ok(());
        }

        // contiguous pid runs
        let mut clusters: Vec<Vec<&Candidate>> = Vec::new();
        for cand in &candidates {
            match clusters.last_mut() {
                Some(cluster) if cluster.last().unwrap().pid + 1 == cand.pid => {
                    cluster.push(cand)
                }
                _ => clusters.push(vec![cand]),
            }
        }

        // small clusters are skipped, except every Nth round
        let filter_active = !exhaustive
            && self.min_write_size > 1
            && !(self.min_write_ignore_freq > 0 && round % self.min_write_ignore_freq == 0);
        if filter_active {
            clusters.retain(|c| c.len() >= self.min_write_size);
        }

        for cluster in clusters {
            self.write_cluster(&cluster)?;
        }
        Ok(())
    }

    fn write_cluster(&self, cluster: &[&Candidate]) -> DbResult {
        // copy phase: SH latch each page, snapshot it, unswizzle the copy
        let mut copies = Vec::new(); // (idx, pid, copy_lsn, image)
        for cand in cluster {
            let frame = self.pool.frame(cand.idx);
            let latch = match frame.latch.acquire(LatchMode::Sh, Timeout::Immediate) {
                Ok(g) => g,
                Err(_) => continue,
            };
            if !frame.cb.is_used() || !frame.cb.is_dirty() || frame.cb.pid() != cand.pid {
                continue;
            }
            let mut copy = latch.get().clone();
            drop(latch);
            self.pool.convert_to_disk_page(&mut copy);
            let copy_lsn = copy.hdr.lsn;
            if copy.hdr.flags & crate::page::PF_TO_BE_DELETED != 0 {
                continue;
            }
            copies.push((cand.idx, cand.pid, copy_lsn, copy.to_image()));
        }
        if copies.is_empty() {
            return Ok(());
        }

        // WAL: everything on these pages must be durable first
        let max_lsn = copies.iter().map(|(_, _, l, _)| *l).max().unwrap();
        self.pool.log_manager().flush(max_lsn)?;
        let clean_lsn = self.pool.log_manager().durable_lsn();

        // write contiguous sub-runs with one pwrite each, then sync
        let mut i = 0;
        while i < copies.len() {
            let mut j = i + 1;
            while j < copies.len() && copies[j].1 == copies[j - 1].1 + 1 {
                j += 1;
            }
            let first = copies[i].1;
            let images: Vec<_> = copies[i..j].iter().map(|(_, _, _, img)| img.clone()).collect();
            self.pool.volume().write_many_pages(first, &images, false)?;
            self.pool.volume().sync()?;

            let mut rec = LogRecord::new(
                CAT_SYSTEM,
                LogPayload::PageWrite {
                    first_pid: first,
                    clean_lsn,
                    count: (j - i) as u32,
                },
            );
            rec.pid = first;
            self.pool.log_manager().insert(&rec)?;
            i = j;
        }

        // mark clean whatever did not move underneath us
        for (idx, pid, copy_lsn, _) in &copies {
            let frame = self.pool.frame(*idx);
            let latch = match frame.latch.acquire(LatchMode::Sh, Timeout::Immediate) {
                Ok(g) => g,
                Err(_) => continue,
            };
            if frame.cb.pid() == *pid && frame.cb.page_lsn() == *copy_lsn {
                frame.cb.mark_clean(clean_lsn);
                Stats::bump(&STATS.cleaned_pages);
            }
            drop(latch);
        }
        Ok(())
    }

    /// Flush every dirty frame; loops until the pool is clean or no
    /// progress can be made.
    pub fn clean_all(&self) -> DbResult {
        for _ in 0..64 {
            if !self.pool.has_dirty_frames() {
                return Ok(());
            }
            self.clean_pass(true)?;
        }
        if self.pool.has_dirty_frames() {
            warn!("clean_all left dirty frames behind (latch contention)");
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
