use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;

pub const FINGERPRINT_WORDS: usize = 4;
const FINGERPRINT_BITS: u64 = (FINGERPRINT_WORDS as u64) * 64;

/// A transaction's fingerprint: two pseudo-random bits derived from the
/// tid. Collisions only cause spurious deadlock reports, which the
/// victim handles like a real one.
pub type Fingerprint = [u64; FINGERPRINT_WORDS];

pub fn fingerprint_of(tid: u64) -> Fingerprint {
    let mut fp = [0u64; FINGERPRINT_WORDS];
    for seed in 0..2u64 {
        let mut h = DefaultHasher::new();
        (tid, seed).hash(&mut h);
        let bit = h.finish() % FINGERPRINT_BITS;
        fp[(bit / 64) as usize] |= 1 << (bit % 64);
    }
    fp
}

pub fn union(a: &mut Fingerprint, b: &Fingerprint) {
    for i in 0..FINGERPRINT_WORDS {
        a[i] |= b[i];
    }
}

pub fn contains(digest: &Fingerprint, fp: &Fingerprint) -> bool {
    (0..FINGERPRINT_WORDS).all(|i| digest[i] & fp[i] == fp[i])
}

/// Published digests of blocked transactions. A waiter repeatedly ORs
/// its blockers' digests into its own; a cycle shows up as the waiter's
/// own fingerprint surfacing in a blocker's digest.
pub struct DreadlockTable {
    digests: DashMap<u64, Fingerprint>,
}

impl DreadlockTable {
    pub fn new() -> Self {
        Self {
            digests: DashMap::new(),
        }
    }

    pub fn publish(&self, tid: u64, digest: Fingerprint) {
        self.digests.insert(tid, digest);
    }

    pub fn digest_of(&self, tid: u64) -> Fingerprint {
        self.digests
            .get(&tid)
            .map(|d| *d)
            .unwrap_or_else(|| fingerprint_of(tid))
    }

    /// Called when a transaction stops waiting (granted, timed out or
    /// aborted).
    pub fn clear(&self, tid: u64) {
        self.digests.remove(&tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_surfaces_in_digest() {
        let table = DreadlockTable::new();
        let (a, b) = (1u64, 2u64);
        let (fa, fb) = (fingerprint_of(a), fingerprint_of(b));

        // a blocked on b
        let mut da = fa;
        union(&mut da, &table.digest_of(b));
        table.publish(a, da);

        // b blocked on a
        let mut db = fb;
        union(&mut db, &table.digest_of(a));
        table.publish(b, db);

        // next round: a sees its own fingerprint in b's digest
        assert!(contains(&table.digest_of(b), &fa));
    }
}
