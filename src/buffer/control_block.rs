use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::{lsn::Lsn, page_id::PageID};

/// Per-frame bookkeeping, all lock-free. The page content itself lives
/// behind the frame's latch; the control block can be read without it.
///
/// `pin_cnt == -1` exactly when the frame is free (not `used`); pinning
/// is a CAS loop that refuses to resurrect a frame being evicted.
pub struct ControlBlock {
    pid: AtomicU32,
    pin_cnt: AtomicI32,
    used: AtomicBool,
    dirty: AtomicBool,
    swizzled: AtomicBool,
    check_recovery: AtomicBool,
    page_lsn: AtomicU64,
    rec_lsn: AtomicU64,
    persisted_lsn: AtomicU64,
    log_volume: AtomicU32,
    /// Reference bit for CLOCK-style policies.
    ref_bit: AtomicBool,
    /// Reference counter for GCLOCK and the refcount cleaner policies.
    ref_count: AtomicU32,
}

impl ControlBlock {
    pub fn new() -> Self {
        Self {
            pid: AtomicU32::new(0),
            pin_cnt: AtomicI32::new(-1),
            used: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            swizzled: AtomicBool::new(false),
            check_recovery: AtomicBool::new(false),
            page_lsn: AtomicU64::new(0),
            rec_lsn: AtomicU64::new(0),
            persisted_lsn: AtomicU64::new(0),
            log_volume: AtomicU32::new(0),
            ref_bit: AtomicBool::new(false),
            ref_count: AtomicU32::new(0),
        }
    }

    /// Claim a free frame (pin_cnt -1 -> 1) and stamp the pid.
    pub fn init(&self, pid: PageID) {
        debug_assert_eq!(self.pin_cnt.load(Ordering::Acquire), -1);
        self.pid.store(pid, Ordering::Relaxed);
        self.dirty.store(false, Ordering::Relaxed);
        self.swizzled.store(false, Ordering::Relaxed);
        self.check_recovery.store(false, Ordering::Relaxed);
        self.page_lsn.store(0, Ordering::Relaxed);
        self.rec_lsn.store(0, Ordering::Relaxed);
        self.persisted_lsn.store(0, Ordering::Relaxed);
        self.log_volume.store(0, Ordering::Relaxed);
        self.ref_bit.store(true, Ordering::Relaxed);
        self.used.store(true, Ordering::Release);
        self.pin_cnt.store(1, Ordering::Release);
    }

    /// Return the frame to the free state. No pins may exist.
    pub fn clear(&self) {
        self.used.store(false, Ordering::Release);
        self.pid.store(0, Ordering::Relaxed);
        self.dirty.store(false, Ordering::Relaxed);
        self.swizzled.store(false, Ordering::Relaxed);
        self.check_recovery.store(false, Ordering::Relaxed);
    }

    pub fn pid(&self) -> PageID {
        self.pid.load(Ordering::Acquire)
    }

    pub fn pin_count(&self) -> i32 {
        self.pin_cnt.load(Ordering::Acquire)
    }

    /// Add a pin unless the frame is free or being evicted.
    pub fn try_pin(&self) -> bool {
        loop {
            let c = self.pin_cnt.load(Ordering::Acquire);
            if c < 0 {
                return false;
            }
            if self
                .pin_cnt
                .compare_exchange(c, c + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn pin(&self) {
        let ok = self.try_pin();
        debug_assert!(ok, "pin on a free frame");
    }

    pub fn unpin(&self) {
        let prev = self.pin_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin below zero");
    }

    /// Eviction entry: freeze an unpinned frame (0 -> -1).
    pub fn try_freeze(&self) -> bool {
        self.pin_cnt
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a freeze when eviction is abandoned mid-way.
    pub fn unfreeze(&self) {
        let ok = self
            .pin_cnt
            .compare_exchange(-1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(ok, "unfreeze on a pinned frame");
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_swizzled(&self) -> bool {
        self.swizzled.load(Ordering::Acquire)
    }

    pub fn set_swizzled(&self, v: bool) {
        self.swizzled.store(v, Ordering::Release);
    }

    pub fn check_recovery(&self) -> bool {
        self.check_recovery.load(Ordering::Acquire)
    }

    pub fn set_check_recovery(&self, v: bool) {
        self.check_recovery.store(v, Ordering::Release);
    }

    pub fn page_lsn(&self) -> Lsn {
        Lsn::from_u64(self.page_lsn.load(Ordering::Acquire))
    }

    pub fn set_page_lsn(&self, lsn: Lsn) {
        self.page_lsn.store(lsn.to_u64(), Ordering::Release);
    }

    pub fn rec_lsn(&self) -> Lsn {
        Lsn::from_u64(self.rec_lsn.load(Ordering::Acquire))
    }

    pub fn persisted_lsn(&self) -> Lsn {
        Lsn::from_u64(self.persisted_lsn.load(Ordering::Acquire))
    }

    /// Record an update at `lsn`: the frame becomes dirty, and the first
    /// dirtying update pins down `rec_lsn`.
    pub fn mark_dirty(&self, lsn: Lsn) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            self.rec_lsn.store(lsn.to_u64(), Ordering::Release);
        }
    }

    /// The cleaner wrote the page out as of `clean_lsn`.
    pub fn mark_clean(&self, clean_lsn: Lsn) {
        self.persisted_lsn.store(clean_lsn.to_u64(), Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
    }

    pub fn log_volume(&self) -> u32 {
        self.log_volume.load(Ordering::Acquire)
    }

    pub fn add_log_volume(&self, bytes: u32) {
        self.log_volume.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn reset_log_volume(&self) {
        self.log_volume.store(0, Ordering::Release);
    }

    pub fn referenced(&self) -> bool {
        self.ref_bit.load(Ordering::Relaxed)
    }

    pub fn set_referenced(&self, v: bool) {
        self.ref_bit.store(v, Ordering::Relaxed);
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub fn set_ref_count(&self, v: u32) {
        self.ref_count.store(v, Ordering::Relaxed);
    }

    /// Saturating decrement; returns the value before the decrement.
    pub fn dec_ref_count(&self) -> u32 {
        loop {
            let c = self.ref_count.load(Ordering::Relaxed);
            if c == 0 {
                return 0;
            }
            if self
                .ref_count
                .compare_exchange(c, c - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return c;
            }
        }
    }
}
