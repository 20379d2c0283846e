pub mod logger;

use core::fmt;
use std::sync::Mutex;

use log::debug;

use crate::{
    database::Database,
    error::DbResult,
    latch::Timeout,
    lock::LockId,
    wal::record::{LogPayload, LogRecordKind},
    lsn::Lsn,
};

use self::logger::Logger;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TxState {
    Active,
    Committing,
    Aborting,
    Ended,
}

struct TxInner {
    state: TxState,
    first_lsn: Lsn,
    last_lsn: Lsn,
    undo_nxt: Lsn,
    locks: Vec<LockId>,
    ssx_depth: u32,
}

/// A transaction: owns its undo chain, its lock set and its savepoints.
/// One thread drives a transaction at a time; the inner mutex only makes
/// that contract safe, it is never contended.
pub struct Transaction {
    tid: u64,
    pub timeout: Timeout,
    inner: Mutex<TxInner>,
}

/// A point the transaction can partially roll back to. Locks acquired
/// after the savepoint are retained.
#[derive(Copy, Clone, Debug)]
pub struct SavePoint {
    pub lsn: Lsn,
}

impl Transaction {
    pub(crate) fn new(tid: u64, timeout: Timeout) -> Self {
        Self {
            tid,
            timeout,
            inner: Mutex::new(TxInner {
                state: TxState::Active,
                first_lsn: Lsn::NULL,
                last_lsn: Lsn::NULL,
                undo_nxt: Lsn::NULL,
                locks: Vec::new(),
                ssx_depth: 0,
            }),
        }
    }

    /// Rebuild a loser transaction found by restart analysis so it can
    /// be rolled back through the regular path.
    pub(crate) fn resurrect(tid: u64, last_lsn: Lsn) -> Self {
        let tx = Self::new(tid, Timeout::Forever);
        {
            let mut inner = tx.inner.lock().unwrap();
            inner.state = TxState::Aborting;
            inner.last_lsn = last_lsn;
            inner.undo_nxt = last_lsn;
        }
        tx
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn state(&self) -> TxState {
        self.inner.lock().unwrap().state
    }

    pub fn last_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().last_lsn
    }

    pub fn first_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().first_lsn
    }

    pub(crate) fn update_last(&self, lsn: Lsn) {
        let mut inner = self.inner.lock().unwrap();
        if inner.first_lsn.is_null() {
            inner.first_lsn = lsn;
        }
        inner.last_lsn = lsn;
        inner.undo_nxt = lsn;
    }

    pub(crate) fn record_lock(&self, id: LockId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.locks.contains(&id) {
            inner.locks.push(id);
        }
    }

    pub(crate) fn lock_ids(&self) -> Vec<LockId> {
        self.inner.lock().unwrap().locks.clone()
    }

    pub fn savepoint(&self) -> SavePoint {
        SavePoint {
            lsn: self.last_lsn(),
        }
    }

    /// Commit. Lazy commit writes the end record but does not wait for
    /// the flush daemon; a non-lazy commit blocks until the end record
    /// is durable (group commit batches the waiters).
    pub fn commit(&self, db: &Database, lazy: bool) -> DbResult {
        {
            let mut inner = self.inner.lock().unwrap();
            assert_eq!(inner.state, TxState::Active, "commit on finished tx");
            assert_eq!(inner.ssx_depth, 0, "commit inside a system transaction");
            inner.state = TxState::Committing;
        }
        Logger::log_xct(db.log_manager(), self, LogPayload::XctEnd)?;
        if !lazy {
            db.log_manager().flush(db.log_manager().curr_lsn())?;
        }
        self.finish(db, TxState::Ended);
        debug!("tx {} committed (lazy: {})", self.tid, lazy);
        Ok(())
    }

    /// Abort: walk the undo chain backwards, compensating every
    /// undoable record, then write the abort record.
    pub fn abort(&self, db: &Database) -> DbResult {
        {
            let mut inner = self.inner.lock().unwrap();
            assert!(
                inner.state == TxState::Active || inner.state == TxState::Aborting,
                "abort on finished tx"
            );
            inner.state = TxState::Aborting;
        }
        self.rollback(db, Lsn::NULL)?;
        Logger::log_xct(db.log_manager(), self, LogPayload::XctAbort)?;
        self.finish(db, TxState::Ended);
        debug!("tx {} aborted", self.tid);
        Ok(())
    }

    /// Partial rollback to a savepoint; locks are retained.
    pub fn rollback_to(&self, db: &Database, sp: SavePoint) -> DbResult {
        self.rollback(db, sp.lsn)
    }

    /// Undo every record after `stop_lsn` (exclusive). Compensation
    /// records carry `undo_nxt` in their back pointer, so a rollback
    /// that crashes and restarts never undoes the same record twice.
    fn rollback(&self, db: &Database, stop_lsn: Lsn) -> DbResult {
        let mut cursor = self.last_lsn();
        while !cursor.is_null() && cursor > stop_lsn {
            let rec = db.log_manager().fetch(cursor)?;
            debug_assert_eq!(rec.tid, self.tid);
            if rec.is_clr() {
                // skip the already-undone range
                cursor = rec.prev_lsn;
                continue;
            }
            if rec.is_undoable() {
                crate::btree::undo_record(db, self, &rec)?;
            }
            if rec.kind() == LogRecordKind::XctBegin {
                break;
            }
            cursor = rec.prev_lsn;
        }
        Ok(())
    }

    /// Finish a transaction whose end record was written by a group
    /// commit; only the per-transaction cleanup is left.
    pub(crate) fn end_group_commit(&self, db: &Database) {
        {
            let mut inner = self.inner.lock().unwrap();
            assert_eq!(inner.state, TxState::Active, "group commit on finished tx");
            inner.state = TxState::Committing;
        }
        self.finish(db, TxState::Ended);
    }

    fn finish(&self, db: &Database, state: TxState) {
        let locks = self.lock_ids();
        db.lock_manager().release_all(self.tid, &locks);
        let mut inner = self.inner.lock().unwrap();
        inner.locks.clear();
        inner.state = state;
        db.forget_tx(self.tid);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.tid)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
