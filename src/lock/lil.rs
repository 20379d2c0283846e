use std::{
    collections::HashMap,
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

use crate::{
    error::{DbError, DbResult},
    latch::Timeout,
    page_id::StoreID,
};

use super::okvl::BaseMode;

/// Light-weight intent locks: one counting lock per store, acquired
/// before any key lock on that store and released together at commit.
pub struct Lil {
    stores: Mutex<HashMap<StoreID, Vec<(u64, BaseMode)>>>,
}

impl Lil {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn intent_store_lock(
        &self,
        tid: u64,
        store: StoreID,
        mode: BaseMode,
        timeout: Timeout,
    ) -> DbResult {
        let deadline = match timeout {
            Timeout::Immediate => None,
            Timeout::Forever => Some(Instant::now() + Duration::from_secs(10)),
            Timeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
        };
        loop {
            {
                let mut stores = self.stores.lock().unwrap();
                let entries = stores.entry(store).or_insert_with(Vec::new);
                let want = entries
                    .iter()
                    .find(|(t, _)| *t == tid)
                    .map(|(_, m)| m.sup(mode))
                    .unwrap_or(mode);
                if entries
                    .iter()
                    .filter(|(t, _)| *t != tid)
                    .all(|(_, m)| m.compatible(want))
                {
                    entries.retain(|(t, _)| *t != tid);
                    entries.push((tid, want));
                    return Ok(());
                }
            }
            match deadline {
                None => return Err(DbError::CondLockTimeout),
                Some(d) if Instant::now() >= d => return Err(DbError::LockTimeout),
                Some(_) => sleep(Duration::from_millis(1)),
            }
        }
    }

    pub fn release_all(&self, tid: u64) {
        let mut stores = self.stores.lock().unwrap();
        for entries in stores.values_mut() {
            entries.retain(|(t, _)| *t != tid);
        }
        stores.retain(|_, v| !v.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_modes_coexist() {
        let lil = Lil::new();
        lil.intent_store_lock(1, 7, BaseMode::IS, Timeout::Immediate)
            .unwrap();
        lil.intent_store_lock(2, 7, BaseMode::IX, Timeout::Immediate)
            .unwrap();
        // S conflicts with the IX holder
        assert!(matches!(
            lil.intent_store_lock(3, 7, BaseMode::S, Timeout::Immediate),
            Err(DbError::CondLockTimeout)
        ));
        lil.release_all(2);
        lil.intent_store_lock(3, 7, BaseMode::S, Timeout::Immediate)
            .unwrap();
    }
}
