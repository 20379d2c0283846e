use std::path::{Path, PathBuf};

use log::debug;

use crate::{error::DbError, io::DbFile, lsn::Lsn};

use super::record::{LogRecord, LogRecordKind, MIN_RECORD_SIZE};

/// One file per partition, named `log.<n>`.
pub fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("log.{}", partition))
}

/// Partition numbers present in the log directory, ascending.
pub fn scan_partition_numbers(dir: &Path) -> Result<Vec<u32>, DbError> {
    let mut nums = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("log.") {
            if let Ok(n) = rest.parse::<u32>() {
                nums.push(n);
            }
        }
    }
    nums.sort_unstable();
    Ok(nums)
}

/// Scan a partition forward and return the LSN just past its last valid
/// record. A torn or corrupt tail record marks the end (standard
/// crash-tail handling).
pub fn find_partition_end(dir: &Path, partition: u32, segsize: usize) -> Result<Lsn, DbError> {
    let file = DbFile::open_readonly(partition_path(dir, partition))?;
    let file_len = file.len()?;
    let mut offset: u64 = 0;

    while offset + MIN_RECORD_SIZE as u64 <= file_len {
        let mut head = [0u8; 4];
        file.read_at(offset, &mut head)?;
        let len = u32::from_le_bytes(head) as u64;
        if len == 0 {
            // zero padding: the segment's tail was too small for a skip
            // record; jump to the next segment boundary
            let boundary = (offset / segsize as u64 + 1) * segsize as u64;
            if boundary >= file_len {
                break;
            }
            offset = boundary;
            continue;
        }
        if len < MIN_RECORD_SIZE as u64 || offset + len > file_len {
            break;
        }
        let mut bytes = vec![0u8; len as usize];
        file.read_at(offset, &mut bytes)?;
        match LogRecord::decode(&bytes) {
            Ok(_) => offset += len,
            Err(_) => {
                debug!(
                    "torn record at {}.{}; treating as end of log",
                    partition, offset
                );
                break;
            }
        }
    }
    Ok(Lsn::new(partition, offset as u32))
}

/// Read the record at `lsn` from its partition file, if the offset holds
/// a valid record. Returns the decoded record (with `lsn` filled in).
pub fn read_record(dir: &Path, lsn: Lsn, segsize: usize) -> Result<Option<LogRecord>, DbError> {
    let path = partition_path(dir, lsn.partition());
    if !path.exists() {
        return Ok(None);
    }
    let file = DbFile::open_readonly(path)?;
    let file_len = file.len()?;
    let offset = lsn.offset() as u64;
    if offset + MIN_RECORD_SIZE as u64 > file_len {
        return Ok(None);
    }
    let mut head = [0u8; 4];
    file.read_at(offset, &mut head)?;
    let len = u32::from_le_bytes(head) as u64;
    if len == 0 {
        return Ok(None);
    }
    if len < MIN_RECORD_SIZE as u64 || len > segsize as u64 || offset + len > file_len {
        return Err(DbError::BadLogRec(format!("bad length {} at {}", len, lsn)));
    }
    let mut bytes = vec![0u8; len as usize];
    file.read_at(offset, &mut bytes)?;
    let mut rec = LogRecord::decode(&bytes)?;
    rec.lsn = lsn;
    Ok(Some(rec))
}

pub fn is_skip(rec: &LogRecord) -> bool {
    rec.kind() == LogRecordKind::Skip
}
