use crossbeam::queue::{ArrayQueue, SegQueue};

use crate::page_id::FrameIdx;

/// Free-frame list. The low-contention variant is an unbounded lock-free
/// queue; the high-contention variant trades allocation-free bounded
/// slots for spinning on a full push (which cannot happen here: the list
/// never holds more than the frame count it was sized for).
pub enum FreeList {
    LowContention(SegQueue<FrameIdx>),
    HighContention(ArrayQueue<FrameIdx>),
}

impl FreeList {
    pub fn new(high_contention: bool, capacity: usize) -> Self {
        if high_contention {
            FreeList::HighContention(ArrayQueue::new(capacity))
        } else {
            FreeList::LowContention(SegQueue::new())
        }
    }

    pub fn push(&self, idx: FrameIdx) {
        match self {
            FreeList::LowContention(q) => q.push(idx),
            FreeList::HighContention(q) => {
                let r = q.push(idx);
                debug_assert!(r.is_ok(), "free list over capacity");
            }
        }
    }

    pub fn pop(&self) -> Option<FrameIdx> {
        match self {
            FreeList::LowContention(q) => q.pop(),
            FreeList::HighContention(q) => q.pop(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FreeList::LowContention(q) => q.len(),
            FreeList::HighContention(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
