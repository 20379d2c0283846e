use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::lsn::Lsn;

/// Per-group cap; a slot stops accepting joiners once its combined
/// reservation would exceed this.
pub const GROUP_MAX: usize = 1 << 18;

const CLOSED: u64 = 1 << 63;
const COUNT_BITS: u32 = 16;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const TOTAL_MASK: u64 = (1 << 40) - 1;

/// One consolidation slot. `state` packs (closed flag, total bytes,
/// joiner count) so that joining is a single CAS.
pub struct CArraySlot {
    state: AtomicU64,
    /// Group base LSN (nonzero once the leader has reserved space).
    base: AtomicU64,
    /// Offset of the group within the segment buffer.
    buf_off: AtomicUsize,
    expected: AtomicU32,
    done: AtomicU32,
}

impl CArraySlot {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            base: AtomicU64::new(0),
            buf_off: AtomicUsize::new(0),
            expected: AtomicU32::new(0),
            done: AtomicU32::new(0),
        }
    }
}

/// The position a joiner got within its group.
pub struct Joined {
    pub slot: usize,
    pub my_off: usize,
    pub leader: bool,
}

/// Consolidation array: concurrent log inserters join a slot, the first
/// joiner becomes the group leader and performs one buffer reservation
/// for the whole group, and everyone copies at a disjoint offset. Only
/// epoch closure and segment rollover serialize.
pub struct ConsolidationArray {
    slots: Vec<CArraySlot>,
}

impl ConsolidationArray {
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0);
        Self {
            slots: (0..slot_count).map(|_| CArraySlot::new()).collect(),
        }
    }

    /// Join a group, preferring the slot hinted by the caller's thread.
    pub fn join(&self, hint: usize, len: usize) -> Joined {
        let n = self.slots.len();
        let mut idx = hint % n;
        loop {
            let slot = &self.slots[idx];
            let state = slot.state.load(Ordering::Acquire);
            let total = ((state >> COUNT_BITS) & TOTAL_MASK) as usize;
            if state & CLOSED != 0 || total + len > GROUP_MAX {
                idx = (idx + 1) % n;
                std::hint::spin_loop();
                continue;
            }
            let new = state + (((len as u64) << COUNT_BITS) | 1);
            if slot
                .state
                .compare_exchange(state, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Joined {
                    slot: idx,
                    my_off: total,
                    leader: state == 0,
                };
            }
        }
    }

    /// Leader only: stop accepting joiners; returns (total bytes, count).
    pub fn close(&self, slot: usize) -> (usize, u32) {
        let state = self.slots[slot].state.fetch_or(CLOSED, Ordering::AcqRel);
        let total = ((state >> COUNT_BITS) & TOTAL_MASK) as usize;
        let count = (state & COUNT_MASK) as u32;
        (total, count)
    }

    /// Leader only: hand the reserved region to the group.
    pub fn publish(&self, slot: usize, base: Lsn, buf_off: usize, count: u32) {
        let s = &self.slots[slot];
        s.buf_off.store(buf_off, Ordering::Relaxed);
        s.expected.store(count, Ordering::Relaxed);
        s.base.store(base.to_u64(), Ordering::Release);
    }

    /// Spin until the leader has published; returns (base lsn, buffer
    /// offset of the group).
    pub fn wait_published(&self, slot: usize) -> (Lsn, usize) {
        let s = &self.slots[slot];
        loop {
            let base = s.base.load(Ordering::Acquire);
            if base != 0 {
                return (Lsn::from_u64(base), s.buf_off.load(Ordering::Relaxed));
            }
            std::hint::spin_loop();
        }
    }

    /// Called after the member's copy is done; the last one out resets
    /// the slot for the next epoch.
    pub fn depart(&self, slot: usize) {
        let s = &self.slots[slot];
        let d = s.done.fetch_add(1, Ordering::AcqRel) + 1;
        if d == s.expected.load(Ordering::Relaxed) {
            s.done.store(0, Ordering::Relaxed);
            s.expected.store(0, Ordering::Relaxed);
            s.base.store(0, Ordering::Relaxed);
            // reopening the slot must be the last store
            s.state.store(0, Ordering::Release);
        }
    }
}
