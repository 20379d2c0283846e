use std::sync::atomic::{AtomicU64, Ordering};

/// Global engine counters.
///
/// Background daemons and hot paths bump these with relaxed atomics; they
/// are never used for control flow. Progress reporting from the eviction
/// policies lands here as well, not on stdout.
pub struct Stats {
    pub log_inserts: AtomicU64,
    pub log_bytes: AtomicU64,
    pub log_flushes: AtomicU64,
    pub log_img_format_bytes: AtomicU64,

    pub page_reads: AtomicU64,
    pub page_writes: AtomicU64,

    pub page_fixes: AtomicU64,
    pub page_hits: AtomicU64,
    pub evictions: AtomicU64,
    pub eviction_rounds: AtomicU64,
    pub cleaner_rounds: AtomicU64,
    pub cleaned_pages: AtomicU64,

    pub spr_runs: AtomicU64,
    pub spr_records_applied: AtomicU64,

    pub restore_segments: AtomicU64,
    pub restore_priority_requests: AtomicU64,

    pub archive_runs: AtomicU64,
    pub archive_records: AtomicU64,
    pub archive_merges: AtomicU64,

    pub lock_waits: AtomicU64,
    pub deadlocks: AtomicU64,
}

macro_rules! zeroed_stats {
    ($($field:ident),+ $(,)?) => {
        Stats { $($field: AtomicU64::new(0)),+ }
    };
}

pub static STATS: Stats = zeroed_stats!(
    log_inserts,
    log_bytes,
    log_flushes,
    log_img_format_bytes,
    page_reads,
    page_writes,
    page_fixes,
    page_hits,
    evictions,
    eviction_rounds,
    cleaner_rounds,
    cleaned_pages,
    spr_runs,
    spr_records_applied,
    restore_segments,
    restore_priority_requests,
    archive_runs,
    archive_records,
    archive_merges,
    lock_waits,
    deadlocks,
);

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
