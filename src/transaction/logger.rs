use crate::{
    buffer::PageGuard,
    error::DbError,
    wal::{
        record::{LogPayload, LogRecord, CAT_CLR, CAT_MULTI_PAGE, CAT_REDO, CAT_SSX, CAT_UNDO},
        LogManager,
    },
    lsn::Lsn,
    stats::{Stats, STATS},
};

use super::Transaction;

/// Every update is funnelled through these helpers: they stamp the
/// per-transaction undo chain and the per-page LSN chain, hand the
/// record to the log, and update the fixed page's LSN bookkeeping.
pub struct Logger;

impl Logger {
    /// Transaction-level record (begin/end/abort); links the undo chain
    /// but touches no page.
    pub fn log_xct(log: &LogManager, tx: &Transaction, payload: LogPayload) -> Result<Lsn, DbError> {
        let mut rec = LogRecord::new(CAT_REDO, payload);
        rec.tid = tx.tid();
        rec.prev_lsn = tx.last_lsn();
        let lsn = log.insert(&rec)?;
        tx.update_last(lsn);
        Ok(lsn)
    }

    /// Redo+undo record against one fixed page (EX latched).
    pub fn log_page(
        log: &LogManager,
        tx: &Transaction,
        page: &mut PageGuard,
        payload: LogPayload,
    ) -> Result<Lsn, DbError> {
        Self::maybe_compress(log, page)?;
        let mut rec = LogRecord::new(CAT_REDO | CAT_UNDO, payload);
        rec.tid = tx.tid();
        rec.prev_lsn = tx.last_lsn();
        rec.pid = page.pid();
        rec.page_prv = page.cb().page_lsn();
        let lsn = log.insert(&rec)?;
        tx.update_last(lsn);
        page.update_page_lsn(lsn, rec.len);
        Ok(lsn)
    }

    /// Compensation record written while rolling back: same redo shape,
    /// but its back pointer jumps over the range already undone.
    pub fn log_page_clr(
        log: &LogManager,
        tx: &Transaction,
        page: &mut PageGuard,
        payload: LogPayload,
        undo_nxt: Lsn,
    ) -> Result<Lsn, DbError> {
        let mut rec = LogRecord::new(CAT_REDO | CAT_CLR, payload);
        rec.tid = tx.tid();
        rec.prev_lsn = undo_nxt;
        rec.pid = page.pid();
        rec.page_prv = page.cb().page_lsn();
        let lsn = log.insert(&rec)?;
        tx.update_last(lsn);
        page.update_page_lsn(lsn, rec.len);
        Ok(lsn)
    }

    /// Single-log system sub-transaction against one page: exactly one
    /// record, no undo linkage, independent of any outer transaction.
    pub fn log_page_ssx(
        log: &LogManager,
        page: &mut PageGuard,
        payload: LogPayload,
    ) -> Result<Lsn, DbError> {
        let mut rec = LogRecord::new(CAT_REDO | CAT_SSX, payload);
        rec.pid = page.pid();
        rec.page_prv = page.cb().page_lsn();
        let lsn = log.insert(&rec)?;
        page.update_page_lsn(lsn, rec.len);
        Ok(lsn)
    }

    /// Multi-page SSX (splits, adoption): one record carrying both
    /// pages' chain links. Returns the record so the caller can drive
    /// the same redo it just logged.
    pub fn log_page2_ssx(
        log: &LogManager,
        p1: &mut PageGuard,
        p2: &mut PageGuard,
        payload: LogPayload,
    ) -> Result<(Lsn, LogRecord), DbError> {
        let mut rec = LogRecord::new(CAT_REDO | CAT_SSX | CAT_MULTI_PAGE, payload);
        rec.pid = p1.pid();
        rec.page2_pid = p2.pid();
        rec.page_prv = p1.cb().page_lsn();
        rec.page2_prv = p2.cb().page_lsn();
        let lsn = log.insert(&rec)?;
        rec.lsn = lsn;
        p1.update_page_lsn(lsn, rec.len);
        p2.update_page_lsn(lsn, rec.len);
        Ok((lsn, rec))
    }

    /// Emit a full page image as an SSX once the page has accumulated
    /// enough log volume; single-page recovery stops at the image.
    fn maybe_compress(log: &LogManager, page: &mut PageGuard) -> Result<(), DbError> {
        let threshold = log.page_img_compression();
        if threshold == 0 || page.cb().log_volume() < threshold {
            return Ok(());
        }
        let mut copy = page.page().clone();
        page.pool().convert_to_disk_page(&mut copy);
        let image = copy.to_image().to_vec();
        Stats::add(&STATS.log_img_format_bytes, image.len() as u64);
        Self::log_page_ssx(log, page, LogPayload::PageImgFormat { image })?;
        page.cb().reset_log_volume();
        Ok(())
    }
}
