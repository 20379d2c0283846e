pub mod dreadlock;
pub mod lil;
pub mod okvl;

use std::{
    collections::hash_map::DefaultHasher,
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    config::Options,
    error::{DbError, DbResult},
    keystr::KeyStr,
    latch::Timeout,
    page_id::StoreID,
    stats::{Stats, STATS},
};

use self::{
    dreadlock::{contains, fingerprint_of, union, DreadlockTable},
    lil::Lil,
    okvl::OkvlMode,
};

/// A lockable resource: 30 bits of key hash plus a 2-bit partition tag.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LockId(pub u32);

const TAG_KEY: u32 = 1;

pub fn key_lock_id(store: StoreID, key: &KeyStr) -> LockId {
    let mut h = DefaultHasher::new();
    store.hash(&mut h);
    key.as_bytes().hash(&mut h);
    LockId(((h.finish() as u32) & 0x3fff_ffff) | (TAG_KEY << 30))
}

#[derive(Default)]
struct LockQueue {
    holders: Vec<(u64, OkvlMode)>,
    waiters: Vec<(u64, OkvlMode)>,
}

struct Bucket {
    queues: HashMap<u32, LockQueue>,
}

/// OKVL key-value lock manager with dreadlock deadlock detection and
/// per-store intent locks. Strict two-phase: everything is released at
/// commit or abort through `release_all`.
pub struct LockManager {
    buckets: Vec<Mutex<Bucket>>,
    dreadlock: DreadlockTable,
    pub lil: Lil,
    spin_interval: Duration,
}

impl LockManager {
    pub fn new(opts: &Options) -> Self {
        let nbuckets = std::cmp::max(16, opts.get_int("sm_locktablesize", 1 << 10) as usize);
        let mut buckets = Vec::with_capacity(nbuckets);
        for _ in 0..nbuckets {
            buckets.push(Mutex::new(Bucket {
                queues: HashMap::new(),
            }));
        }
        Self {
            buckets,
            dreadlock: DreadlockTable::new(),
            lil: Lil::new(),
            spin_interval: Duration::from_millis(
                std::cmp::max(1, opts.get_int("sm_rawlock_gc_interval_ms", 1)) as u64,
            ),
        }
    }

    fn bucket_of(&self, id: LockId) -> &Mutex<Bucket> {
        &self.buckets[id.0 as usize % self.buckets.len()]
    }

    /// Acquire (or upgrade to) `mode` on `id`.
    ///
    /// Blocking requests resolve conflicts with the dreadlock spin; an
    /// `Immediate` request that cannot be granted returns
    /// `CondLockTimeout` and stays queued, so the caller must either
    /// `retry_lock` or release.
    pub fn acquire(&self, tid: u64, id: LockId, mode: OkvlMode, timeout: Timeout) -> DbResult {
        let deadline = match timeout {
            Timeout::Immediate => None,
            Timeout::Forever => Some(Instant::now() + Duration::from_secs(10)),
            Timeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
        };
        let own_fp = fingerprint_of(tid);
        let mut waited = false;

        loop {
            let blockers: Vec<u64> = {
                let mut bucket = self.bucket_of(id).lock().unwrap();
                let q = bucket.queues.entry(id.0).or_default();
                let want = q
                    .holders
                    .iter()
                    .find(|(t, _)| *t == tid)
                    .map(|(_, m)| m.sup(mode))
                    .unwrap_or(mode);
                let conflicting: Vec<u64> = q
                    .holders
                    .iter()
                    .filter(|(t, m)| *t != tid && !m.compatible(want))
                    .map(|(t, _)| *t)
                    .collect();
                if conflicting.is_empty() {
                    q.holders.retain(|(t, _)| *t != tid);
                    q.holders.push((tid, want));
                    q.waiters.retain(|(t, _)| *t != tid);
                    if waited {
                        self.dreadlock.clear(tid);
                    }
                    return Ok(());
                }
                if !q.waiters.iter().any(|(t, _)| *t == tid) {
                    q.waiters.push((tid, mode));
                }
                conflicting
            };

            if deadline.is_none() {
                // conditional request: leave the waiter queued
                return Err(DbError::CondLockTimeout);
            }
            if Instant::now() >= deadline.unwrap() {
                self.remove_waiter(tid, id);
                self.dreadlock.clear(tid);
                return Err(DbError::LockTimeout);
            }

            if !waited {
                Stats::bump(&STATS.lock_waits);
                waited = true;
            }

            // dreadlock: publish own digest, check the blockers' digests
            // for our own fingerprint
            let mut digest = own_fp;
            let mut victim = false;
            for b in &blockers {
                let bd = self.dreadlock.digest_of(*b);
                if contains(&bd, &own_fp) {
                    // a cycle; the largest tid involved backs out
                    if *b < tid {
                        victim = true;
                    }
                }
                union(&mut digest, &bd);
            }
            self.dreadlock.publish(tid, digest);
            if victim {
                self.remove_waiter(tid, id);
                self.dreadlock.clear(tid);
                Stats::bump(&STATS.deadlocks);
                debug!("deadlock: tx {} backs out of lock {:?}", tid, id);
                return Err(DbError::Deadlock);
            }

            sleep(self.spin_interval);
        }
    }

    /// Re-attempt a conditional request that was left queued.
    pub fn retry_lock(&self, tid: u64, id: LockId, mode: OkvlMode) -> DbResult {
        self.acquire(tid, id, mode, Timeout::Immediate)
    }

    fn remove_waiter(&self, tid: u64, id: LockId) {
        let mut bucket = self.bucket_of(id).lock().unwrap();
        if let Some(q) = bucket.queues.get_mut(&id.0) {
            q.waiters.retain(|(t, _)| *t != tid);
        }
    }

    /// Release every lock the transaction holds (strict 2PL: called at
    /// commit or abort), including its intent locks.
    pub fn release_all(&self, tid: u64, ids: &[LockId]) {
        for id in ids {
            let mut bucket = self.bucket_of(*id).lock().unwrap();
            if let Some(q) = bucket.queues.get_mut(&id.0) {
                q.holders.retain(|(t, _)| *t != tid);
                q.waiters.retain(|(t, _)| *t != tid);
                if q.holders.is_empty() && q.waiters.is_empty() {
                    bucket.queues.remove(&id.0);
                }
            }
        }
        self.lil.release_all(tid);
        self.dreadlock.clear(tid);
    }

    /// Current mode held by `tid` on `id` (for assertions).
    pub fn mode_of(&self, tid: u64, id: LockId) -> OkvlMode {
        let mut bucket = self.bucket_of(id).lock().unwrap();
        bucket
            .queues
            .entry(id.0)
            .or_default()
            .holders
            .iter()
            .find(|(t, _)| *t == tid)
            .map(|(_, m)| *m)
            .unwrap_or(OkvlMode::N_N)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lm() -> LockManager {
        LockManager::new(&Options::new())
    }

    #[test]
    fn test_grant_and_conflict() {
        let lm = lm();
        let id = LockId(42);
        lm.acquire(1, id, OkvlMode::S_N, Timeout::Immediate).unwrap();
        lm.acquire(2, id, OkvlMode::S_N, Timeout::Immediate).unwrap();
        assert!(matches!(
            lm.acquire(3, id, OkvlMode::X_N, Timeout::Immediate),
            Err(DbError::CondLockTimeout)
        ));
        // gap mode is orthogonal to the shared key holders
        lm.acquire(3, id, OkvlMode::N_X, Timeout::Immediate).unwrap();

        lm.release_all(1, &[id]);
        lm.release_all(2, &[id]);
        lm.release_all(3, &[id]);
        lm.acquire(4, id, OkvlMode::X_N, Timeout::Immediate).unwrap();
    }

    #[test]
    fn test_upgrade() {
        let lm = lm();
        let id = LockId(7);
        lm.acquire(1, id, OkvlMode::S_N, Timeout::Immediate).unwrap();
        lm.acquire(1, id, OkvlMode::N_X, Timeout::Immediate).unwrap();
        let m = lm.mode_of(1, id);
        assert_eq!(m, OkvlMode::S_N.sup(OkvlMode::N_X));
    }

    #[test]
    fn test_deadlock_detected() {
        use std::sync::Arc;
        let lm = Arc::new(lm());
        let a = LockId(1);
        let b = LockId(2);
        lm.acquire(1, a, OkvlMode::X_N, Timeout::Forever).unwrap();
        lm.acquire(2, b, OkvlMode::X_N, Timeout::Forever).unwrap();

        let lm2 = Arc::clone(&lm);
        let t = std::thread::spawn(move || {
            // tx 2 wants a while holding b
            let r = lm2.acquire(2, a, OkvlMode::X_N, Timeout::Forever);
            if r.is_err() {
                lm2.release_all(2, &[b]);
            }
            r
        });
        std::thread::sleep(Duration::from_millis(20));
        // tx 1 wants b while holding a: cycle
        let r1 = lm.acquire(1, b, OkvlMode::X_N, Timeout::Forever);
        let r2 = t.join().unwrap();

        let deadlocked =
            matches!(r1, Err(DbError::Deadlock)) as u32 + matches!(r2, Err(DbError::Deadlock)) as u32;
        assert_eq!(deadlocked, 1, "exactly one victim");
        lm.release_all(1, &[a, b]);
    }
}
