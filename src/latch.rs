use std::{sync::Arc, time::Duration};

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};

use crate::error::DbError;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LatchMode {
    Sh,
    Ex,
}

/// How long a blocking engine API is willing to wait.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Timeout {
    Immediate,
    Forever,
    Millis(u64),
}

/// Read/write latch protecting a value, usually a page frame.
///
/// Guards are self-contained (they keep the lock alive through an Arc), so
/// latch coupling can hand guards across call boundaries: fix the child,
/// then drop the parent guard.
pub struct Latch<T> {
    lock: Arc<RwLock<T>>,
}

enum Inner<T> {
    Sh(ArcRwLockReadGuard<RawRwLock, T>),
    Ex(ArcRwLockWriteGuard<RawRwLock, T>),
}

pub struct LatchGuard<T> {
    // always Some; emptied only transiently during upgrade/downgrade
    inner: Option<Inner<T>>,
}

impl<T> Latch<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: Arc::new(RwLock::new(value)),
        }
    }

    pub fn acquire(&self, mode: LatchMode, timeout: Timeout) -> Result<LatchGuard<T>, DbError> {
        let inner = match (mode, timeout) {
            (LatchMode::Sh, Timeout::Forever) => Inner::Sh(self.lock.read_arc()),
            (LatchMode::Ex, Timeout::Forever) => Inner::Ex(self.lock.write_arc()),
            (LatchMode::Sh, Timeout::Immediate) => {
                Inner::Sh(self.lock.try_read_arc().ok_or(DbError::LatchInUse)?)
            }
            (LatchMode::Ex, Timeout::Immediate) => {
                Inner::Ex(self.lock.try_write_arc().ok_or(DbError::LatchInUse)?)
            }
            (LatchMode::Sh, Timeout::Millis(ms)) => Inner::Sh(
                self.lock
                    .try_read_arc_for(Duration::from_millis(ms))
                    .ok_or(DbError::LatchTimeout)?,
            ),
            (LatchMode::Ex, Timeout::Millis(ms)) => Inner::Ex(
                self.lock
                    .try_write_arc_for(Duration::from_millis(ms))
                    .ok_or(DbError::LatchTimeout)?,
            ),
        };
        Ok(LatchGuard { inner: Some(inner) })
    }

    /// Peek at the value without latching. Only for assertions and stats.
    pub fn is_locked_exclusive(&self) -> bool {
        self.lock.try_read().is_none()
    }
}

impl<T> LatchGuard<T> {
    pub fn mode(&self) -> LatchMode {
        match self.inner.as_ref().unwrap() {
            Inner::Sh(_) => LatchMode::Sh,
            Inner::Ex(_) => LatchMode::Ex,
        }
    }

    pub fn get(&self) -> &T {
        match self.inner.as_ref().unwrap() {
            Inner::Sh(g) => g,
            Inner::Ex(g) => g,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        match self.inner.as_mut().unwrap() {
            Inner::Sh(_) => panic!("get_mut on a shared latch"),
            Inner::Ex(g) => g,
        }
    }

    /// Conditionally upgrade SH to EX.
    ///
    /// The share is released for an instant while the exclusive request is
    /// tried, so on success the caller must revalidate whatever it read
    /// under the share. Failure re-acquires the share and returns
    /// `LatchInUse`.
    pub fn try_upgrade(&mut self) -> Result<(), DbError> {
        let inner = self.inner.take().unwrap();
        match inner {
            Inner::Ex(g) => {
                self.inner = Some(Inner::Ex(g));
                Ok(())
            }
            Inner::Sh(g) => {
                let lock = ArcRwLockReadGuard::rwlock(&g).clone();
                drop(g);
                match lock.try_write_arc() {
                    Some(w) => {
                        self.inner = Some(Inner::Ex(w));
                        Ok(())
                    }
                    None => {
                        self.inner = Some(Inner::Sh(lock.read_arc()));
                        Err(DbError::LatchInUse)
                    }
                }
            }
        }
    }

    /// Downgrade EX to SH without releasing.
    pub fn downgrade(&mut self) {
        let inner = self.inner.take().unwrap();
        match inner {
            Inner::Sh(g) => self.inner = Some(Inner::Sh(g)),
            Inner::Ex(g) => self.inner = Some(Inner::Sh(ArcRwLockWriteGuard::downgrade(g))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes() {
        let latch = Latch::new(7);

        let a = latch.acquire(LatchMode::Sh, Timeout::Forever).unwrap();
        let b = latch.acquire(LatchMode::Sh, Timeout::Immediate).unwrap();
        assert_eq!(*a.get(), 7);
        assert_eq!(*b.get(), 7);

        // exclusive conflicts with the shares
        assert!(matches!(
            latch.acquire(LatchMode::Ex, Timeout::Immediate),
            Err(DbError::LatchInUse)
        ));

        drop(a);
        drop(b);
        let mut c = latch.acquire(LatchMode::Ex, Timeout::Forever).unwrap();
        *c.get_mut() = 8;
        c.downgrade();
        assert_eq!(*c.get(), 8);
    }

    #[test]
    fn test_upgrade() {
        let latch = Latch::new(0);
        let mut g = latch.acquire(LatchMode::Sh, Timeout::Forever).unwrap();
        g.try_upgrade().unwrap();
        assert_eq!(g.mode(), LatchMode::Ex);

        let other = latch.acquire(LatchMode::Sh, Timeout::Immediate);
        assert!(other.is_err());
    }
}
