use object_backend::BackendError;
use thiserror::Error;

/// Error kinds of the block management core.
///
/// Every variant maps to a POSIX errno through `errno()`; `marks_fsck()`
/// tells the caller whether the filesystem must be flagged as needing a
/// consistency check before the error is surfaced.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such backend object: {0}")]
    NoSuchObject(String),
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("no such row")]
    NoSuchRow,
    #[error("content hash mismatch for object {0}")]
    HashMismatch(String),
    #[error("metadata corrupt: {0}")]
    Corrupt(String),
    #[error("constraint violated: {0}")]
    ConstraintViolated(String),
    #[error("database error: {0}")]
    Db(String),
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
    #[error("operation timed out")]
    Timeout,
    #[error("background worker failed: {0}")]
    Embedded(String),
    #[error("usage error (errno {0})")]
    Usage(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NoSuchObject(_) => libc::EIO,
            FsError::Transient(_) => libc::EAGAIN,
            FsError::NoSuchRow => libc::ENOENT,
            FsError::HashMismatch(_) => libc::EIO,
            FsError::Corrupt(_) => libc::EIO,
            FsError::ConstraintViolated(_) => libc::EIO,
            FsError::Db(_) => libc::EIO,
            FsError::InvariantViolated(_) => libc::EIO,
            FsError::Timeout => libc::EIO,
            FsError::Embedded(_) => libc::EIO,
            FsError::Usage(errno) => *errno,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Errors that leave the filesystem in a state only fsck can repair.
    pub fn marks_fsck(&self) -> bool {
        matches!(
            self,
            FsError::HashMismatch(_) | FsError::Corrupt(_) | FsError::InvariantViolated(_)
        )
    }
}

impl From<BackendError> for FsError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NoSuchObject(key) => FsError::NoSuchObject(key),
            BackendError::Transient(msg) => FsError::Transient(msg),
            BackendError::BadMeta(key) => FsError::Corrupt(format!("object metadata: {}", key)),
            BackendError::Io(e) => FsError::Io(e),
        }
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &e {
            rusqlite::Error::QueryReturnedNoRows => FsError::NoSuchRow,
            rusqlite::Error::SqliteFailure(err, msg) => match err.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    FsError::Corrupt(msg.clone().unwrap_or_else(|| e.to_string()))
                }
                ErrorCode::ConstraintViolation => {
                    FsError::ConstraintViolated(msg.clone().unwrap_or_else(|| e.to_string()))
                }
                _ => FsError::Db(e.to_string()),
            },
            _ => FsError::Db(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NoSuchRow.errno(), libc::ENOENT);
        assert_eq!(FsError::Usage(libc::ENOTEMPTY).errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::Timeout.errno(), libc::EIO);
    }

    #[test]
    fn fsck_marking() {
        assert!(FsError::HashMismatch("s3ql_data_1".to_string()).marks_fsck());
        assert!(FsError::Corrupt("header".to_string()).marks_fsck());
        assert!(!FsError::NoSuchRow.marks_fsck());
        assert!(!FsError::Timeout.marks_fsck());
    }
}
