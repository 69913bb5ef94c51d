//! Open-file wrapper applying hooks to read, write and fsync.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use nix::errno::Errno;
use tracing::warn;

use crate::backing::{Attr, LowerFile};
use crate::error::OrErrno;
use crate::hook::Hook;
use crate::intercept::{Op, Outcome, intercept, status};

/// A backing-store file plus the hook that was active when it was opened.
///
/// The hook is captured once. Disabling the filesystem's hook later does
/// not affect handles that are already open.
pub struct HookFile {
    file: Box<dyn LowerFile>,
    path: PathBuf,
    hook: Option<Arc<dyn Hook>>,
}

impl HookFile {
    pub fn new(file: Box<dyn LowerFile>, path: impl Into<PathBuf>, hook: Option<Arc<dyn Hook>>) -> Self {
        Self {
            file,
            path: path.into(),
            hook,
        }
    }

    /// Path of this file relative to the backing root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_hooked(&self) -> bool {
        self.hook.is_some()
    }

    pub fn read(&self, size: u32, offset: i64) -> Result<Vec<u8>, Errno> {
        let cap = self.hook.as_deref().and_then(Hook::on_read);
        let outcome = intercept(
            Op::Read,
            &self.path,
            cap,
            |h| h.pre_read(&self.path, size, offset),
            || self.file.read(size, offset).or_errno(),
            |h, real, ctx| h.post_read(real.as_deref().map_err(|e| *e), ctx),
        );
        match outcome {
            Outcome::Delegated(real) => real,
            Outcome::ShortCircuit { data, error } => status(error).map(|()| data),
            Outcome::Overridden { real, data, error } => {
                let real_len = real.as_ref().map_or(0, Vec::len);
                if data.len() != real_len {
                    warn!(
                        path = %self.path.display(),
                        posthook_len = data.len(),
                        real_len,
                        "Posthooked, but posthook buffer length != lower buffer length"
                    );
                }
                status(error).map(|()| data)
            }
        }
    }

    /// A hooked write that is short-circuited or overridden reports zero bytes.
    pub fn write(&self, data: &[u8], offset: i64) -> Result<u32, Errno> {
        let cap = self.hook.as_deref().and_then(Hook::on_write);
        let outcome = intercept(
            Op::Write,
            &self.path,
            cap,
            |h| h.pre_write(&self.path, data, offset),
            || self.file.write(data, offset).or_errno(),
            |h, real, ctx| h.post_write(*real, ctx),
        );
        match outcome {
            Outcome::Delegated(real) => real,
            Outcome::ShortCircuit { error, .. } | Outcome::Overridden { error, .. } => {
                status(error).map(|()| 0)
            }
        }
    }

    pub fn fsync(&self, datasync: bool) -> Result<(), Errno> {
        let cap = self.hook.as_deref().and_then(Hook::on_fsync);
        let outcome = intercept(
            Op::Fsync,
            &self.path,
            cap,
            |h| h.pre_fsync(&self.path, datasync),
            || self.file.fsync(datasync).or_errno(),
            |h, real, ctx| h.post_fsync(*real, ctx),
        );
        outcome.into_status()
    }

    pub fn flush(&self) -> Result<(), Errno> {
        self.file.flush().or_errno()
    }

    pub fn release(&self) {
        self.file.release();
    }

    pub fn truncate(&self, size: u64) -> Result<(), Errno> {
        self.file.truncate(size).or_errno()
    }

    pub fn getattr(&self) -> Result<Attr, Errno> {
        self.file.getattr().or_errno()
    }

    pub fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
        self.file.chown(uid, gid).or_errno()
    }

    pub fn chmod(&self, mode: u32) -> Result<(), Errno> {
        self.file.chmod(mode).or_errno()
    }

    pub fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Result<(), Errno> {
        self.file.utimens(atime, mtime).or_errno()
    }

    pub fn allocate(&self, offset: u64, size: u64, mode: i32) -> Result<(), Errno> {
        self.file.allocate(offset, size, mode).or_errno()
    }

    pub fn flock(&self, operation: i32) -> Result<(), Errno> {
        self.file.flock(operation).or_errno()
    }

    /// The wrapped backing-store file.
    pub fn inner(&self) -> &dyn LowerFile {
        self.file.as_ref()
    }
}

impl fmt::Display for HookFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HookFile{{file={}, path={}}}", self.file, self.path.display())
    }
}

impl fmt::Debug for HookFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookFile")
            .field("path", &self.path)
            .field("file", &self.file)
            .field("hooked", &self.hook.is_some())
            .finish()
    }
}
