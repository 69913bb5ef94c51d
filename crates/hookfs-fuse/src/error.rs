//! Error handling and mapping for the FUSE adapter.
//!
//! Façade results already carry an [`Errno`]; this module covers the
//! adapter's own failures (stale inodes and handles, mount errors) and maps
//! them to the codes FUSE returns to the kernel.

use std::io;

use hookfs::{Errno, HookFsError, io_error_to_errno};
use thiserror::Error;

use crate::executor::ExecutorError;

pub use hookfs::ToErrno;

/// FUSE-specific errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FuseError {
    /// Setting up the hooked filesystem failed.
    #[error("Filesystem setup failed: {0}")]
    Setup(#[from] HookFsError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Status returned by the hooked filesystem.
    #[error("Operation failed: {0}")]
    Status(#[from] Errno),

    /// Invalid inode.
    #[error("Invalid inode: {0}")]
    InvalidInode(u64),

    /// Invalid file handle.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Wrong handle type (e.g., tried to read from a directory handle).
    #[error("Wrong handle type for operation")]
    WrongHandleType,

    /// Name is not valid for the backing store.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Mounting or unmounting the session failed.
    #[error("Mount failed: {0}")]
    Mount(io::Error),

    /// The worker pool could not be started.
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Setup(e) => e.to_errno(),
            FuseError::Io(e) | FuseError::Mount(e) => io_error_to_errno(e),
            FuseError::Status(e) => *e as i32,
            FuseError::InvalidInode(_) => libc::ENOENT,
            FuseError::InvalidHandle(_) | FuseError::WrongHandleType => libc::EBADF,
            FuseError::InvalidName(_) => libc::EINVAL,
            FuseError::Executor(ExecutorError::Spawn { source, .. }) => io_error_to_errno(source),
        }
    }
}

impl ToErrno for FuseError {
    fn to_errno(&self) -> i32 {
        FuseError::to_errno(self)
    }
}

/// Result type for FUSE operations.
pub type FuseResult<T> = Result<T, FuseError>;
