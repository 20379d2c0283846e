use std::path::{Path, PathBuf};

use crate::{
    error::{DbError, DbResult},
    io::DbFile,
    lsn::Lsn,
    page::{PageImage, PAGE_SIZE},
    page_id::PageID,
};

/// A registered backup: sparse copy of the volume at `backup_lsn`.
#[derive(Clone, Debug)]
pub struct BackupFile {
    pub path: PathBuf,
    pub backup_lsn: Lsn,
}

/// Read side of a backup file during restore. Pages past the backup's
/// extent read as zeroes (the backup is allowed to be shorter than the
/// volume).
pub struct BackupReader {
    file: DbFile,
    pub backup_lsn: Lsn,
}

impl BackupReader {
    pub fn open(path: &Path, backup_lsn: Lsn) -> Result<Self, DbError> {
        Ok(Self {
            file: DbFile::open_readonly(path)?,
            backup_lsn,
        })
    }

    pub fn read_page(&self, pid: PageID, img: &mut PageImage) -> DbResult {
        self.file
            .read_at_short(pid as u64 * PAGE_SIZE as u64, &mut img[..])?;
        Ok(())
    }
}

/// Write side used while taking a backup.
pub struct BackupWriter {
    file: DbFile,
}

impl BackupWriter {
    pub fn create(path: &Path) -> Result<Self, DbError> {
        let file = DbFile::open(path)?;
        file.set_len(0)?;
        Ok(Self { file })
    }

    pub fn write_page(&self, pid: PageID, img: &PageImage) -> DbResult {
        self.file
            .write_at(pid as u64 * PAGE_SIZE as u64, &img[..])
    }

    pub fn finish(self) -> DbResult {
        self.file.sync()
    }
}
