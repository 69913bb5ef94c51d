//! Error types and errno conversion.
//!
//! Operations report their status as [`Errno`]. Every backing-store error
//! crosses into that currency through [`status_of`], so the protocol engine
//! only ever sees one kind of error.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised while setting up a hooked filesystem.
#[derive(Debug, Error)]
pub enum HookFsError {
    /// The backing directory does not exist or is not a directory.
    #[error("Original path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// Log level outside the supported range.
    #[error("Invalid log level {0} (expected 0..=2)")]
    InvalidLogLevel(u8),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl HookFsError {
    /// Converts this error to a libc error code.
    pub fn to_errno(&self) -> i32 {
        match self {
            HookFsError::NotADirectory(_) => libc::ENOTDIR,
            HookFsError::InvalidLogLevel(_) => libc::EINVAL,
            HookFsError::Io(e) => io_error_to_errno(e),
        }
    }
}

pub type HookFsResult<T> = Result<T, HookFsError>;

/// Extracts the OS error code, falling back to `EIO` for synthetic errors.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Status carried by an `io::Error`.
pub fn status_of(e: &io::Error) -> Errno {
    Errno::from_raw(io_error_to_errno(e))
}

/// Converts backing-store results into operation statuses.
pub trait OrErrno<T> {
    fn or_errno(self) -> Result<T, Errno>;
}

impl<T> OrErrno<T> for io::Result<T> {
    fn or_errno(self) -> Result<T, Errno> {
        self.map_err(|e| status_of(&e))
    }
}

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    fn to_errno(&self) -> i32;
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

impl ToErrno for Errno {
    fn to_errno(&self) -> i32 {
        *self as i32
    }
}

impl ToErrno for HookFsError {
    fn to_errno(&self) -> i32 {
        HookFsError::to_errno(self)
    }
}
