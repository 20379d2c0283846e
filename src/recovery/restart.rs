use std::collections::HashMap;

use log::{debug, info};

use crate::{
    buffer::FixFlags,
    database::Database,
    error::{DbError, DbResult},
    latch::LatchMode,
    wal::record::{LogPayload, LogRecordKind},
    lsn::Lsn,
    page_id::PageID,
    transaction::Transaction,
};

/// What a forward pass over the log discovers.
pub struct Analysis {
    /// Per-page recovery targets: the last logged update of every page.
    pub emlsns: HashMap<PageID, Lsn>,
    /// Transactions with no end record: (tid, last record lsn).
    pub losers: Vec<(u64, Lsn)>,
    pub max_tid: u64,
}

/// Forward log analysis from the oldest retained partition: rebuilds
/// the transaction table and the per-page recovery targets, and replays
/// allocation/store records into the volume caches as it goes.
pub fn analysis(db: &Database) -> Result<Analysis, DbError> {
    let log = db.log_manager();
    let vol = db.volume();
    let mut emlsns: HashMap<PageID, Lsn> = HashMap::new();
    let mut tx_table: HashMap<u64, Lsn> = HashMap::new();
    let mut max_tid = 0u64;

    let mut scanner = log.scan(log.oldest_lsn(), log.durable_lsn());
    while let Some(rec) = scanner.next() {
        let rec = rec?;
        if rec.tid != 0 {
            max_tid = max_tid.max(rec.tid);
            match rec.kind() {
                LogRecordKind::XctEnd | LogRecordKind::XctAbort => {
                    tx_table.remove(&rec.tid);
                }
                _ => {
                    tx_table.insert(rec.tid, rec.lsn);
                }
            }
        }
        if let LogPayload::XctEndGroup { tids } = &rec.payload {
            for t in tids {
                tx_table.remove(t);
            }
        }

        if rec.is_redo() && rec.pid != 0 {
            let e = emlsns.entry(rec.pid).or_insert(Lsn::NULL);
            *e = (*e).max(rec.lsn);
            if rec.is_multi_page() && rec.page2_pid != 0 {
                let e = emlsns.entry(rec.page2_pid).or_insert(Lsn::NULL);
                *e = (*e).max(rec.lsn);
            }
        }

        vol.redo_cache_record(&rec);
    }

    let losers: Vec<(u64, Lsn)> = tx_table.into_iter().collect();
    info!(
        "restart analysis: {} pages with pending redo, {} loser transactions",
        emlsns.len(),
        losers.len()
    );
    Ok(Analysis {
        emlsns,
        losers,
        max_tid,
    })
}

/// Restart after a crash.
///
/// With instant restart the redo targets are parked in the buffer pool
/// and each page recovers on its first fix; log-based redo instead
/// fixes every affected page now. Losers are rolled back with CLRs and
/// closed with an abort record either way.
pub fn restart(db: &Database) -> Result<Analysis, DbError> {
    let out = analysis(db)?;

    let instant = db.options().get_bool("sm_restart_instant", true);
    let log_based = db.options().get_bool("sm_restart_log_based_redo", false);

    db.buffer_pool().set_restart_emlsns(out.emlsns.clone());

    if log_based || !instant {
        let mut pids: Vec<(PageID, Lsn)> = out
            .emlsns
            .iter()
            .map(|(p, l)| (*p, *l))
            .collect();
        pids.sort_unstable();
        for (pid, emlsn) in pids {
            if !db.volume().is_allocated_page(pid) {
                continue;
            }
            let mut flags = FixFlags::default();
            flags.emlsn = emlsn;
            match db.buffer_pool().fix_nonroot(None, pid, LatchMode::Sh, flags) {
                Ok(_) => {}
                Err(DbError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        debug!("log-based redo finished");
    }

    // undo the losers through the regular rollback path
    for (tid, last_lsn) in &out.losers {
        debug!("rolling back loser tx {} from {}", tid, last_lsn);
        let tx = Transaction::resurrect(*tid, *last_lsn);
        tx.abort(db)?;
    }
    if !out.losers.is_empty() {
        db.log_manager().flush(Lsn::NULL)?;
    }
    Ok(out)
}

/// Write a fuzzy checkpoint: the active-transaction table and the dirty
/// page table, bracketed by begin/end records.
pub fn take_checkpoint(db: &Database) -> DbResult {
    let log = db.log_manager();
    let begin = {
        let rec = crate::wal::record::LogRecord::new(
            crate::wal::record::CAT_SYSTEM,
            LogPayload::ChkptBegin,
        );
        log.insert(&rec)?
    };
    let active_txs = db.active_tx_table();
    let dirty_pages = db.buffer_pool().dirty_page_table();
    let rec = crate::wal::record::LogRecord::new(
        crate::wal::record::CAT_SYSTEM,
        LogPayload::ChkptEnd {
            active_txs,
            dirty_pages,
        },
    );
    log.insert(&rec)?;
    log.flush(Lsn::NULL)?;
    debug!("checkpoint taken at {}", begin);
    Ok(())
}
