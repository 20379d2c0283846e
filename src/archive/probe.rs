use crate::{error::DbError, lsn::Lsn, page_id::PageID, wal::record::LogRecord};

use super::{run::RunReader, ArchiveDir};

/// Probe the archive for one page's log records in `[from, to]`, across
/// all levels, in LSN order. Records present in several runs (because of
/// replication or in-flight merges) are deduplicated by LSN.
pub fn archive_iterator(
    dir: &ArchiveDir,
    pid: PageID,
    from: Lsn,
    to: Lsn,
) -> Result<Vec<LogRecord>, DbError> {
    let mut hits = Vec::new();
    for meta in dir.all_runs() {
        if !meta.overlaps(from, Lsn::from_u64(to.to_u64() + 1)) {
            continue;
        }
        let reader = RunReader::open(&meta)?;
        hits.extend(reader.probe(pid, from, to)?);
    }
    hits.sort_by_key(|e| e.lsn);
    hits.dedup_by_key(|e| e.lsn);

    let mut out = Vec::with_capacity(hits.len());
    for entry in hits {
        out.push(entry.decode_record()?);
    }
    Ok(out)
}
