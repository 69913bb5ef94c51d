//! Shared fixtures: a loopback backing store that records every call.

#![allow(dead_code)]

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use hookfs::{Attr, DirEntry, HookFs, HookFsConfig, Hook, LoopbackFs, LowerFile, PathFs, StatFs};
use parking_lot::Mutex;
use tempfile::TempDir;

/// Ordered log of backing-store and hook calls.
#[derive(Debug, Default)]
pub struct Calls {
    log: Mutex<Vec<&'static str>>,
    debug: Mutex<Option<bool>>,
}

impl Calls {
    pub fn hit(&self, name: &'static str) {
        self.log.lock().push(name);
    }

    pub fn count(&self, name: &str) -> usize {
        self.log.lock().iter().filter(|n| **n == name).count()
    }

    pub fn log(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    /// Last debug mode handed to the backing store, if any.
    pub fn debug_mode(&self) -> Option<bool> {
        *self.debug.lock()
    }
}

/// Loopback store that records each delegated call in a [`Calls`] log.
#[derive(Debug)]
pub struct CountingFs {
    inner: LoopbackFs,
    calls: Arc<Calls>,
}

impl CountingFs {
    pub fn new(root: &Path, calls: Arc<Calls>) -> Self {
        Self {
            inner: LoopbackFs::new(root),
            calls,
        }
    }
}

impl PathFs for CountingFs {
    fn name(&self) -> String {
        format!("CountingFs({})", self.inner.name())
    }

    fn set_debug(&self, debug: bool) {
        *self.calls.debug.lock() = Some(debug);
        self.inner.set_debug(debug);
    }

    fn on_mount(&self) {
        self.calls.hit("fs.on_mount");
    }

    fn getattr(&self, path: &Path) -> io::Result<Attr> {
        self.calls.hit("fs.getattr");
        self.inner.getattr(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.calls.hit("fs.chmod");
        self.inner.chmod(path, mode)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        self.calls.hit("fs.chown");
        self.inner.chown(path, uid, gid)
    }

    fn utimens(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
        self.calls.hit("fs.utimens");
        self.inner.utimens(path, atime, mtime)
    }

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        self.calls.hit("fs.truncate");
        self.inner.truncate(path, size)
    }

    fn access(&self, path: &Path, mask: i32) -> io::Result<()> {
        self.calls.hit("fs.access");
        self.inner.access(path, mask)
    }

    fn link(&self, existing: &Path, link: &Path) -> io::Result<()> {
        self.calls.hit("fs.link");
        self.inner.link(existing, link)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.calls.hit("fs.mkdir");
        self.inner.mkdir(path, mode)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> io::Result<()> {
        self.calls.hit("fs.mknod");
        self.inner.mknod(path, mode, rdev)
    }

    fn rename(&self, old: &Path, new: &Path) -> io::Result<()> {
        self.calls.hit("fs.rename");
        self.inner.rename(old, new)
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        self.calls.hit("fs.rmdir");
        self.inner.rmdir(path)
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        self.calls.hit("fs.unlink");
        self.inner.unlink(path)
    }

    fn getxattr(&self, path: &Path, name: &OsStr) -> io::Result<Vec<u8>> {
        self.calls.hit("fs.getxattr");
        self.inner.getxattr(path, name)
    }

    fn listxattr(&self, path: &Path) -> io::Result<Vec<OsString>> {
        self.calls.hit("fs.listxattr");
        self.inner.listxattr(path)
    }

    fn removexattr(&self, path: &Path, name: &OsStr) -> io::Result<()> {
        self.calls.hit("fs.removexattr");
        self.inner.removexattr(path, name)
    }

    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
        self.calls.hit("fs.setxattr");
        self.inner.setxattr(path, name, value, flags)
    }

    fn open(&self, path: &Path, flags: i32) -> io::Result<Box<dyn LowerFile>> {
        self.calls.hit("fs.open");
        let file = self.inner.open(path, flags)?;
        Ok(Box::new(CountingFile {
            inner: file,
            calls: Arc::clone(&self.calls),
        }))
    }

    fn create(&self, path: &Path, flags: i32, mode: u32) -> io::Result<Box<dyn LowerFile>> {
        self.calls.hit("fs.create");
        let file = self.inner.create(path, flags, mode)?;
        Ok(Box::new(CountingFile {
            inner: file,
            calls: Arc::clone(&self.calls),
        }))
    }

    fn opendir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.calls.hit("fs.opendir");
        self.inner.opendir(path)
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        self.calls.hit("fs.symlink");
        self.inner.symlink(target, link)
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        self.calls.hit("fs.readlink");
        self.inner.readlink(path)
    }

    fn statfs(&self, path: &Path) -> io::Result<StatFs> {
        self.calls.hit("fs.statfs");
        self.inner.statfs(path)
    }
}

#[derive(Debug)]
pub struct CountingFile {
    inner: Box<dyn LowerFile>,
    calls: Arc<Calls>,
}

impl fmt::Display for CountingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountingFile({})", self.inner)
    }
}

impl LowerFile for CountingFile {
    fn read(&self, size: u32, offset: i64) -> io::Result<Vec<u8>> {
        self.calls.hit("file.read");
        self.inner.read(size, offset)
    }

    fn write(&self, data: &[u8], offset: i64) -> io::Result<u32> {
        self.calls.hit("file.write");
        self.inner.write(data, offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.calls.hit("file.flush");
        self.inner.flush()
    }

    fn release(&self) {
        self.calls.hit("file.release");
        self.inner.release();
    }

    fn fsync(&self, datasync: bool) -> io::Result<()> {
        self.calls.hit("file.fsync");
        self.inner.fsync(datasync)
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.inner.truncate(size)
    }

    fn getattr(&self) -> io::Result<Attr> {
        self.inner.getattr()
    }

    fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        self.inner.chown(uid, gid)
    }

    fn chmod(&self, mode: u32) -> io::Result<()> {
        self.inner.chmod(mode)
    }

    fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
        self.inner.utimens(atime, mtime)
    }

    fn allocate(&self, offset: u64, size: u64, mode: i32) -> io::Result<()> {
        self.inner.allocate(offset, size, mode)
    }

    fn flock(&self, operation: i32) -> io::Result<()> {
        self.inner.flock(operation)
    }

    fn inner(&self) -> Option<&dyn LowerFile> {
        Some(self.inner.as_ref())
    }
}

/// A hooked filesystem over a fresh temp directory.
pub struct Fixture {
    pub dir: TempDir,
    pub calls: Arc<Calls>,
    pub fs: HookFs,
}

impl Fixture {
    pub fn new(hook: Option<Arc<dyn Hook>>) -> Self {
        Self::with_calls(Arc::new(Calls::default()), hook)
    }

    /// Like [`Fixture::new`], logging backing-store calls into `calls`.
    pub fn with_calls(calls: Arc<Calls>, hook: Option<Arc<dyn Hook>>) -> Self {
        Self::with_config(calls, hook, HookFsConfig::default())
    }

    pub fn with_config(calls: Arc<Calls>, hook: Option<Arc<dyn Hook>>, config: HookFsConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let backing = CountingFs::new(dir.path(), Arc::clone(&calls));
        let fs = HookFs::with_backing(Box::new(backing), dir.path(), "/mnt/hookfs-test", hook, config);
        Self { dir, calls, fs }
    }

    /// Path in the backing directory, for checking effects directly.
    pub fn backing(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Writes a file straight into the backing directory.
    pub fn seed(&self, rel: &str, contents: &[u8]) {
        std::fs::write(self.backing(rel), contents).expect("seed file");
    }
}
