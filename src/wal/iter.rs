use std::sync::Arc;

use crate::{error::DbError, lsn::Lsn};

use super::{
    partition::{is_skip, partition_path, read_record},
    record::LogRecord,
    LogManager,
};

/// Forward scan over a durable LSN range. Skip records and zero padding
/// are stepped over transparently; reverse traversal goes through the
/// explicit per-transaction and per-page back pointers instead (see
/// `LogManager::fetch`).
pub struct LogScanner {
    log: Arc<LogManager>,
    next: Lsn,
    end: Lsn,
}

impl LogScanner {
    pub fn new(log: Arc<LogManager>, from: Lsn, end: Lsn) -> Self {
        let next = if from.is_null() { log.oldest_lsn() } else { from };
        Self { log, next, end }
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next
    }

    fn segsize(&self) -> usize {
        self.log.segment_size()
    }

    /// Advance past padding: next segment boundary, or next partition
    /// when the current one is exhausted.
    fn jump(&self, from: Lsn) -> Lsn {
        let segsize = self.segsize() as u64;
        let boundary = (from.offset() as u64 / segsize + 1) * segsize;
        if boundary >= self.log.partition_size() {
            Lsn::new(from.partition() + 1, 0)
        } else {
            Lsn::new(from.partition(), boundary as u32)
        }
    }
}

impl Iterator for LogScanner {
    type Item = Result<LogRecord, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.next >= self.end {
                return None;
            }
            match read_record(self.log.dir(), self.next, self.segsize()) {
                Err(e) => return Some(Err(e)),
                Ok(None) => {
                    // zero padding or a missing partition file
                    let jumped = self.jump(self.next);
                    if jumped <= self.next {
                        return None;
                    }
                    self.next = jumped;
                }
                Ok(Some(rec)) => {
                    let at = self.next;
                    self.next = at.advance(rec.len);
                    if is_skip(&rec) {
                        continue;
                    }
                    return Some(Ok(rec));
                }
            }
        }
    }
}
