use thiserror::Error;

/// Error codes surfaced by the storage engine.
///
/// The variants fall into four families (see `is_retryable` and friends):
/// retryable conditions the caller loops on, transactional outcomes the
/// caller decides about, structural corruption, and environmental states
/// that are handled out-of-band.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("duplicate key")]
    Duplicate,

    #[error("key not found")]
    NotFound,

    #[error("record does not fit in a page")]
    RecWontFit,

    #[error("buffer pool full, no evictable frame")]
    BfFull,

    #[error("volume marked failed")]
    VolFailed,

    #[error("a backup operation is already in progress")]
    BackupBusy,

    #[error("spurious lock conflict, retry")]
    LockRetry,

    #[error("deadlock detected")]
    Deadlock,

    #[error("lock acquisition timed out")]
    LockTimeout,

    #[error("conditional lock request failed, request still queued")]
    CondLockTimeout,

    #[error("log space exhausted")]
    OutOfLogSpace,

    #[error("bad log record: {0}")]
    BadLogRec(String),

    #[error("operation timed out")]
    Timeout,

    #[error("latch acquisition timed out")]
    LatchTimeout,

    #[error("latch held in conflicting mode")]
    LatchInUse,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad option: {0}")]
    Config(String),

    #[error("corruption: {0}")]
    Corrupt(String),
}

impl DbError {
    /// Spurious failures the caller is expected to loop on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::LockRetry | DbError::CondLockTimeout | DbError::LatchInUse
        )
    }

    /// Outcomes the owning transaction decides about (abort or continue);
    /// the engine never auto-aborts on these.
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            DbError::Deadlock
                | DbError::OutOfLogSpace
                | DbError::NotFound
                | DbError::Duplicate
                | DbError::RecWontFit
        )
    }

    /// Fatal in production builds.
    pub fn is_structural(&self) -> bool {
        matches!(self, DbError::BadLogRec(_) | DbError::Corrupt(_))
    }
}

pub type DbResult = Result<(), DbError>;
