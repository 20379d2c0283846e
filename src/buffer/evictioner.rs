use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use rand::Rng;

use crate::{
    config::Options,
    latch::{LatchMode, Timeout},
    wal::record::{LogPayload, LogRecord, CAT_SYSTEM},
    page_id::{FrameIdx, PageID},
    stats::{Stats, STATS},
};

use super::BufferPool;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EvictPolicy {
    Random,
    Loop,
    Clock,
    GClock,
    Car,
}

impl EvictPolicy {
    pub fn from_str(s: &str) -> Self {
        match s {
            "random" => EvictPolicy::Random,
            "clock" => EvictPolicy::Clock,
            "gclock" => EvictPolicy::GClock,
            "car" => EvictPolicy::Car,
            _ => EvictPolicy::Loop,
        }
    }
}

/// CAR bookkeeping: two clocks of resident frames plus two ghost queues
/// of recently evicted pids, with the adaptive target `p`.
struct CarState {
    t1: VecDeque<FrameIdx>,
    t2: VecDeque<FrameIdx>,
    b1: VecDeque<PageID>,
    b2: VecDeque<PageID>,
    p: usize,
}

struct PolicyState {
    hand: usize,
    car: CarState,
}

/// Background evictioner: refills the free list when it drops below the
/// batch ratio, picking victims under the configured policy.
pub struct PageEvictioner {
    pool: Arc<BufferPool>,
    policy: EvictPolicy,
    interval_ms: u64,
    batch: usize,
    /// Write a dirty victim out as part of evicting it.
    flush_dirty: bool,
    /// Allow dirty victims at all (no-db / write-elision setups).
    evict_dirty: bool,
    log_evictions: bool,

    state: Mutex<PolicyState>,
    wake: (Mutex<bool>, Condvar),
    shutdown: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PageEvictioner {
    pub fn new(pool: Arc<BufferPool>, opts: &Options) -> Arc<Self> {
        let block_cnt = pool.block_count();
        let batch_ppm = opts.get_int("sm_evictioner_batch_ratio_ppm", 10_000) as usize;
        let capacity = block_cnt;
        Arc::new(Self {
            pool,
            policy: EvictPolicy::from_str(&opts.get_string("sm_evictioner_policy", "loop")),
            interval_ms: opts.get_int("sm_evictioner_interval_millisec", 100) as u64,
            batch: std::cmp::max(1, block_cnt * batch_ppm / 1_000_000),
            flush_dirty: opts.get_bool("sm_bf_evictioner_flush_dirty_pages", false),
            evict_dirty: opts.get_bool("sm_evict_dirty_pages", false),
            log_evictions: opts.get_bool("sm_bf_evictioner_log_evictions", false),
            state: Mutex::new(PolicyState {
                hand: 0,
                car: CarState {
                    t1: VecDeque::new(),
                    t2: VecDeque::new(),
                    b1: VecDeque::with_capacity(capacity),
                    b2: VecDeque::with_capacity(capacity),
                    p: 0,
                },
            }),
            wake: (Mutex::new(false), Condvar::new()),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("page-evictioner".to_string())
            .spawn(move || me.main_loop())
            .expect("spawn evictioner");
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn wakeup(&self) {
        let (lock, cv) = &self.wake;
        *lock.lock().unwrap() = true;
        cv.notify_one();
    }

    fn main_loop(self: Arc<Self>) {
        debug!("page evictioner started");
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
            if self.pool.free_count() < self.batch {
                self.evict_batch();
            }
        }
        debug!("page evictioner stopped");
    }

    /// Fix-path hooks feeding the adaptive policies.
    pub fn on_hit(&self, _idx: FrameIdx) {
        // the reference bit / counter were refreshed by the fix itself
    }

    pub fn on_miss(&self, pid: PageID, idx: FrameIdx) {
        if self.policy != EvictPolicy::Car {
            return;
        }
        let c = self.pool.block_count();
        let mut state = self.state.lock().unwrap();
        let car = &mut state.car;
        if let Some(pos) = car.b1.iter().position(|p| *p == pid) {
            // ghost hit in B1: grow the T1 target
            let delta = std::cmp::max(1, car.b2.len() / std::cmp::max(1, car.b1.len()));
            car.p = std::cmp::min(car.p + delta, c);
            car.b1.remove(pos);
            car.t2.push_back(idx);
        } else if let Some(pos) = car.b2.iter().position(|p| *p == pid) {
            // ghost hit in B2: shrink the T1 target
            let delta = std::cmp::max(1, car.b1.len() / std::cmp::max(1, car.b2.len()));
            car.p = car.p.saturating_sub(delta);
            car.b2.remove(pos);
            car.t2.push_back(idx);
        } else {
            car.t1.push_back(idx);
        }
    }

    /// Refill the free list up to the batch target. Returns how many
    /// frames were freed.
    pub fn evict_batch(&self) -> usize {
        Stats::bump(&STATS.eviction_rounds);
        let mut freed = 0;
        let block_cnt = self.pool.block_count();
        // bounded sweep so a pool full of pinned pages terminates
        let mut examined = 0;
        let limit = block_cnt * 4;
        while freed < self.batch && examined < limit {
            let victim = match self.pick_victim(&mut examined) {
                Some(idx) => idx,
                None => break,
            };
            if self.try_evict(victim) {
                freed += 1;
            }
        }
        freed
    }

    fn pick_victim(&self, examined: &mut usize) -> Option<FrameIdx> {
        let block_cnt = self.pool.block_count();
        if block_cnt == 0 {
            return None;
        }
        match self.policy {
            EvictPolicy::Random => {
                *examined += 1;
                let idx = rand::thread_rng().gen_range(1, block_cnt as FrameIdx + 1);
                Some(idx)
            }
            EvictPolicy::Loop => {
                *examined += 1;
                let mut state = self.state.lock().unwrap();
                state.hand = state.hand % block_cnt + 1;
                Some(state.hand as FrameIdx)
            }
            EvictPolicy::Clock => {
                let mut state = self.state.lock().unwrap();
                loop {
                    *examined += 1;
                    if *examined >= block_cnt * 4 {
                        return None;
                    }
                    state.hand = state.hand % block_cnt + 1;
                    let cb = &self.pool.frame(state.hand as FrameIdx).cb;
                    if cb.is_used() && cb.referenced() {
                        cb.set_referenced(false);
                        continue;
                    }
                    return Some(state.hand as FrameIdx);
                }
            }
            EvictPolicy::GClock => {
                let mut state = self.state.lock().unwrap();
                loop {
                    *examined += 1;
                    if *examined >= block_cnt * 8 {
                        return None;
                    }
                    state.hand = state.hand % block_cnt + 1;
                    let cb = &self.pool.frame(state.hand as FrameIdx).cb;
                    if cb.is_used() && cb.dec_ref_count() > 0 {
                        continue;
                    }
                    return Some(state.hand as FrameIdx);
                }
            }
            EvictPolicy::Car => self.pick_victim_car(examined),
        }
    }

    fn pick_victim_car(&self, examined: &mut usize) -> Option<FrameIdx> {
        let c = self.pool.block_count();
        let mut state = self.state.lock().unwrap();
        loop {
            *examined += 1;
            if *examined >= c * 4 {
                return None;
            }
            if state.car.t1.is_empty() && state.car.t2.is_empty() {
                // frames fixed before the policy was attached: sweep
                state.hand = state.hand % c + 1;
                return Some(state.hand as FrameIdx);
            }
            let use_t1 = state.car.t1.len() >= std::cmp::max(1, state.car.p);
            if use_t1 && !state.car.t1.is_empty() {
                let idx = state.car.t1.pop_front().unwrap();
                let cb = &self.pool.frame(idx).cb;
                if cb.is_used() && cb.referenced() {
                    cb.set_referenced(false);
                    state.car.t2.push_back(idx);
                    continue;
                }
                if cb.is_used() {
                    if state.car.b1.len() >= c {
                        state.car.b1.pop_front();
                    }
                    let pid = cb.pid();
                    state.car.b1.push_back(pid);
                }
                return Some(idx);
            }
            if let Some(idx) = state.car.t2.pop_front() {
                let cb = &self.pool.frame(idx).cb;
                if cb.is_used() && cb.referenced() {
                    cb.set_referenced(false);
                    state.car.t2.push_back(idx);
                    continue;
                }
                if cb.is_used() {
                    if state.car.b2.len() >= c {
                        state.car.b2.pop_front();
                    }
                    let pid = cb.pid();
                    state.car.b2.push_back(pid);
                }
                return Some(idx);
            }
        }
    }

    /// Attempt to evict one frame; false when the victim is unsuitable.
    fn try_evict(&self, idx: FrameIdx) -> bool {
        let pool = &self.pool;
        if pool.is_root_frame(idx) {
            return false;
        }
        let frame = pool.frame(idx);
        if !frame.cb.is_used() {
            return false;
        }
        let latch = match frame.latch.acquire(LatchMode::Ex, Timeout::Immediate) {
            Ok(g) => g,
            Err(_) => return false,
        };
        if !frame.cb.is_used() {
            return false;
        }

        {
            let page = latch.get();
            if pool.swizzling_enabled() && !page.is_leaf() {
                // interior pages may hold swizzled pointers we cannot chase
                return false;
            }
            if pool.swizzling_enabled() && page.foster != 0 {
                return false;
            }
        }

        if frame.cb.is_dirty() {
            if self.flush_dirty {
                if !self.flush_victim(idx, &latch) {
                    return false;
                }
            } else if !self.evict_dirty {
                return false;
            }
        }

        let expected_pins = if frame.cb.is_swizzled() { 1 } else { 0 };
        if frame.cb.pin_count() != expected_pins {
            return false;
        }

        let page_lsn = frame.cb.page_lsn();
        if !pool.unswizzle_and_update_emlsn(idx, page_lsn) {
            return false;
        }
        if !frame.cb.try_freeze() {
            return false;
        }

        let pid = frame.cb.pid();
        if self.log_evictions {
            let rec = LogRecord::new(CAT_SYSTEM, LogPayload::EvictPage { pid });
            let _ = pool.log_manager().insert(&rec);
        }
        pool.release_frame(idx);
        drop(latch);
        true
    }

    /// Write a dirty victim out before eviction (EX latch held).
    fn flush_victim(
        &self,
        idx: FrameIdx,
        latch: &crate::latch::LatchGuard<crate::btree::page::BTreePage>,
    ) -> bool {
        let pool = &self.pool;
        let frame = pool.frame(idx);
        let mut copy = latch.get().clone();
        pool.convert_to_disk_page(&mut copy);
        let copy_lsn = copy.hdr.lsn;
        if pool.log_manager().flush(copy_lsn).is_err() {
            return false;
        }
        let pid = frame.cb.pid();
        match pool
            .volume()
            .write_many_pages(pid, &[copy.to_image()], false)
        {
            Ok(()) => {
                let clean = pool.log_manager().durable_lsn();
                frame.cb.mark_clean(clean);
                true
            }
            Err(e) => {
                warn!("evictioner flush of page {} failed: {}", pid, e);
                false
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
