mod fs_types;
mod guest_path;

pub use fs_types::*;
pub use guest_path::*;

use thiserror::Error;

/// Status taxonomy shared by every redirector operation. Host error codes are
/// mapped into this set once, at the I/O boundary; nothing host-specific
/// crosses it.
#[derive(Error, Debug)]
pub enum RedirError {
    #[error("no such root: {0}")]
    NoSuchRoot(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("lock conflict: {0}")]
    LockConflict(String),
    #[error("not locked: {0}")]
    NotLocked(String),
    #[error("sharing violation: {0}")]
    SharingViolation(String),
    #[error("disk full: {0}")]
    DiskFull(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

pub type RedirResult<T> = std::result::Result<T, RedirError>;

impl RedirError {
    /// Stable wire name of the status, used by the request envelope.
    pub fn status_name(&self) -> &'static str {
        match self {
            RedirError::NoSuchRoot(_) => "no_such_root",
            RedirError::InvalidPath(_) => "invalid_path",
            RedirError::AccessDenied(_) => "access_denied",
            RedirError::InvalidHandle(_) => "invalid_handle",
            RedirError::NotFound(_) => "not_found",
            RedirError::AlreadyExists(_) => "already_exists",
            RedirError::NotEmpty(_) => "not_empty",
            RedirError::LockConflict(_) => "lock_conflict",
            RedirError::NotLocked(_) => "not_locked",
            RedirError::SharingViolation(_) => "sharing_violation",
            RedirError::DiskFull(_) => "disk_full",
            RedirError::IoError(_) => "io_error",
            RedirError::Unsupported(_) => "unsupported",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RedirError::NotFound(_))
    }
}

impl From<std::io::Error> for RedirError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => RedirError::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => RedirError::AccessDenied(err.to_string()),
            ErrorKind::AlreadyExists => RedirError::AlreadyExists(err.to_string()),
            ErrorKind::WriteZero => RedirError::DiskFull(err.to_string()),
            _ => match err.raw_os_error() {
                Some(code) => map_os_error(code, err.to_string()),
                None => RedirError::IoError(err.to_string()),
            },
        }
    }
}

#[cfg(unix)]
fn map_os_error(code: i32, info: String) -> RedirError {
    match code {
        libc::ENOSPC | libc::EDQUOT => RedirError::DiskFull(info),
        libc::ENOTEMPTY => RedirError::NotEmpty(info),
        libc::EBUSY | libc::ETXTBSY => RedirError::SharingViolation(info),
        libc::ENAMETOOLONG => RedirError::InvalidPath(info),
        libc::ENOTDIR => RedirError::NotFound(info),
        libc::EROFS | libc::EACCES | libc::EPERM => RedirError::AccessDenied(info),
        _ => RedirError::IoError(info),
    }
}

#[cfg(windows)]
fn map_os_error(code: i32, info: String) -> RedirError {
    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;
    const ERROR_HANDLE_DISK_FULL: i32 = 39;
    const ERROR_DISK_FULL: i32 = 112;
    const ERROR_DIR_NOT_EMPTY: i32 = 145;
    const ERROR_FILENAME_EXCED_RANGE: i32 = 206;
    match code {
        ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION => RedirError::SharingViolation(info),
        ERROR_HANDLE_DISK_FULL | ERROR_DISK_FULL => RedirError::DiskFull(info),
        ERROR_DIR_NOT_EMPTY => RedirError::NotEmpty(info),
        ERROR_FILENAME_EXCED_RANGE => RedirError::InvalidPath(info),
        _ => RedirError::IoError(info),
    }
}

#[cfg(not(any(unix, windows)))]
fn map_os_error(_code: i32, info: String) -> RedirError {
    RedirError::IoError(info)
}
