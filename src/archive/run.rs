use std::{
    convert::TryInto,
    path::{Path, PathBuf},
};

use crate::{
    error::{DbError, DbResult},
    io::DbFile,
    wal::record::LogRecord,
    lsn::Lsn,
    page_id::PageID,
};

const RUN_MAGIC: u32 = 0x5a52_554e; // "ZRUN"

/// A run on disk: entries sorted by (pid, lsn), followed by a bucket
/// index in the trailer mapping pid ranges to file offsets.
///
/// Entry layout: pid(4) lsn(8) record bytes (self-delimiting).
/// Trailer: [pid(4) offset(8)]* count(4) trailer_offset(8) magic(4).
#[derive(Clone, Debug)]
pub struct RunMeta {
    pub path: PathBuf,
    pub level: u32,
    pub start: Lsn,
    pub end: Lsn,
}

impl RunMeta {
    pub fn file_name(level: u32, start: Lsn, end: Lsn) -> String {
        format!(
            "run-{}-{:016x}-{:016x}",
            level,
            start.to_u64(),
            end.to_u64()
        )
    }

    pub fn parse_file_name(dir: &Path, name: &str) -> Option<RunMeta> {
        let rest = name.strip_prefix("run-")?;
        let mut parts = rest.splitn(3, '-');
        let level = parts.next()?.parse::<u32>().ok()?;
        let start = u64::from_str_radix(parts.next()?, 16).ok()?;
        let end = u64::from_str_radix(parts.next()?, 16).ok()?;
        Some(RunMeta {
            path: dir.join(name),
            level,
            start: Lsn::from_u64(start),
            end: Lsn::from_u64(end),
        })
    }

    pub fn overlaps(&self, from: Lsn, to: Lsn) -> bool {
        self.start < to && from < self.end
    }
}

/// One archived record, keyed by the pid it is filed under (a multi-page
/// record is filed once per affected page).
#[derive(Clone, Debug)]
pub struct RunEntry {
    pub pid: PageID,
    pub lsn: Lsn,
    pub bytes: Vec<u8>,
}

impl RunEntry {
    pub fn decode_record(&self) -> Result<LogRecord, DbError> {
        let mut rec = LogRecord::decode(&self.bytes)?;
        rec.lsn = self.lsn;
        Ok(rec)
    }
}

pub struct RunWriter {
    file: DbFile,
    path: PathBuf,
    level: u32,
    start: Lsn,
    end: Lsn,
    offset: u64,
    bucket_size: usize,
    index: Vec<(PageID, u64)>,
    since_last_index: usize,
}

impl RunWriter {
    pub fn create(
        dir: &Path,
        level: u32,
        start: Lsn,
        end: Lsn,
        bucket_size: usize,
    ) -> Result<Self, DbError> {
        let path = dir.join(RunMeta::file_name(level, start, end));
        let file = DbFile::open(&path)?;
        file.set_len(0)?;
        Ok(Self {
            file,
            path,
            level,
            start,
            end,
            offset: 0,
            bucket_size,
            index: Vec::new(),
            since_last_index: usize::MAX, // force an entry for the first record
        })
    }

    /// Entries must arrive in (pid, lsn) order.
    pub fn append(&mut self, entry: &RunEntry) -> DbResult {
        if self.since_last_index >= self.bucket_size {
            self.index.push((entry.pid, self.offset));
            self.since_last_index = 0;
        }
        let mut buf = Vec::with_capacity(12 + entry.bytes.len());
        buf.extend_from_slice(&entry.pid.to_le_bytes());
        buf.extend_from_slice(&entry.lsn.to_u64().to_le_bytes());
        buf.extend_from_slice(&entry.bytes);
        self.file.write_at(self.offset, &buf)?;
        self.offset += buf.len() as u64;
        self.since_last_index = self.since_last_index.saturating_add(buf.len());
        Ok(())
    }

    pub fn finish(self) -> Result<RunMeta, DbError> {
        let trailer_offset = self.offset;
        let mut buf = Vec::new();
        for (pid, off) in &self.index {
            buf.extend_from_slice(&pid.to_le_bytes());
            buf.extend_from_slice(&off.to_le_bytes());
        }
        buf.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        buf.extend_from_slice(&trailer_offset.to_le_bytes());
        buf.extend_from_slice(&RUN_MAGIC.to_le_bytes());
        self.file.write_at(trailer_offset, &buf)?;
        self.file.sync()?;
        Ok(RunMeta {
            path: self.path,
            level: self.level,
            start: self.start,
            end: self.end,
        })
    }
}

pub struct RunReader {
    file: DbFile,
    data_end: u64,
    index: Vec<(PageID, u64)>,
}

impl RunReader {
    pub fn open(meta: &RunMeta) -> Result<Self, DbError> {
        let file = DbFile::open_readonly(&meta.path)?;
        let len = file.len()?;
        if len < 16 {
            return Err(DbError::Corrupt(format!("short run file {:?}", meta.path)));
        }
        let mut tail = [0u8; 16];
        file.read_at(len - 16, &mut tail)?;
        let count = u32::from_le_bytes(tail[0..4].try_into().unwrap()) as usize;
        let trailer_offset = u64::from_le_bytes(tail[4..12].try_into().unwrap());
        let magic = u32::from_le_bytes(tail[12..16].try_into().unwrap());
        if magic != RUN_MAGIC {
            return Err(DbError::Corrupt(format!("bad run magic in {:?}", meta.path)));
        }
        let mut index = Vec::with_capacity(count);
        let mut buf = vec![0u8; count * 12];
        file.read_at(trailer_offset, &mut buf)?;
        for i in 0..count {
            let pid = u32::from_le_bytes(buf[i * 12..i * 12 + 4].try_into().unwrap());
            let off = u64::from_le_bytes(buf[i * 12 + 4..i * 12 + 12].try_into().unwrap());
            index.push((pid, off));
        }
        Ok(Self {
            file,
            data_end: trailer_offset,
            index,
        })
    }

    fn read_entry_at(&self, offset: u64) -> Result<Option<(RunEntry, u64)>, DbError> {
        if offset + 16 > self.data_end {
            return Ok(None);
        }
        let mut head = [0u8; 16];
        self.file.read_at(offset, &mut head)?;
        let pid = u32::from_le_bytes(head[0..4].try_into().unwrap());
        let lsn = Lsn::from_u64(u64::from_le_bytes(head[4..12].try_into().unwrap()));
        let rec_len = u32::from_le_bytes(head[12..16].try_into().unwrap()) as usize;
        if offset + 12 + rec_len as u64 > self.data_end {
            return Err(DbError::Corrupt("run entry past data end".to_string()));
        }
        let mut bytes = vec![0u8; rec_len];
        self.file.read_at(offset + 12, &mut bytes)?;
        Ok(Some((RunEntry { pid, lsn, bytes }, offset + 12 + rec_len as u64)))
    }

    /// Sequential scan of the whole run.
    pub fn scan_all(&self) -> Result<Vec<RunEntry>, DbError> {
        let mut out = Vec::new();
        let mut off = 0;
        while let Some((entry, next)) = self.read_entry_at(off)? {
            out.push(entry);
            off = next;
        }
        Ok(out)
    }

    /// All entries for `pid` with `from <= lsn <= to`, in lsn order.
    /// Starts at the nearest bucket-index offset below the pid.
    pub fn probe(&self, pid: PageID, from: Lsn, to: Lsn) -> Result<Vec<RunEntry>, DbError> {
        let mut off = match self.index.iter().rev().find(|(p, _)| *p <= pid) {
            Some((_, o)) => *o,
            None => 0,
        };
        let mut out = Vec::new();
        while let Some((entry, next)) = self.read_entry_at(off)? {
            if entry.pid > pid {
                break;
            }
            if entry.pid == pid && entry.lsn >= from && entry.lsn <= to {
                out.push(entry);
            }
            off = next;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::{LogPayload, CAT_REDO, CAT_SYSTEM};

    fn entry(pid: PageID, lsn: u64) -> RunEntry {
        let rec = LogRecord::new(CAT_SYSTEM | CAT_REDO, LogPayload::UpdateEmlsn {
            child_pid: pid,
            emlsn: Lsn::from_u64(lsn),
        });
        RunEntry {
            pid,
            lsn: Lsn::from_u64(lsn),
            bytes: rec.encode(),
        }
    }

    #[test]
    fn test_write_probe_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RunWriter::create(
            dir.path(),
            0,
            Lsn::from_u64(1),
            Lsn::from_u64(100),
            64,
        )
        .unwrap();
        for (i, pid) in [1u32, 1, 2, 5, 5, 5, 9].iter().enumerate() {
            w.append(&entry(*pid, i as u64 + 1)).unwrap();
        }
        let meta = w.finish().unwrap();

        let r = RunReader::open(&meta).unwrap();
        let all = r.scan_all().unwrap();
        assert_eq!(all.len(), 7);

        let hits = r.probe(5, Lsn::from_u64(0), Lsn::from_u64(u64::MAX)).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].lsn < w[1].lsn));

        let none = r.probe(7, Lsn::from_u64(0), Lsn::from_u64(u64::MAX)).unwrap();
        assert!(none.is_empty());
    }
}
