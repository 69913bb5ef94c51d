//! FUSE filesystem implementation for hookfs.
//!
//! [`HookFuse`] implements the fuser `Filesystem` trait on top of a
//! [`HookFs`] façade. The façade is path-addressed, so this layer owns the
//! inode table and the handle table and translates between the two.
//!
//! # Operation mapping
//!
//! | Operation | Façade call | Notes |
//! |-----------|-------------|-------|
//! | init/destroy | `on_mount`/`on_unmount` | |
//! | lookup | `getattr` | Increments nlookup via `get_or_insert` |
//! | forget/batch_forget | | Decrements nlookup, evicts at 0 |
//! | getattr/setattr | `getattr`, `chmod`, `chown`, `truncate`, `utimens` | Handle variants when `fh` is given |
//! | mkdir/rmdir/rename | hooked | Run on the executor; rename flags are rejected |
//! | open/opendir | hooked | Run on the executor; opendir snapshots the listing |
//! | read/write/fsync | hooked through the handle | Run on the executor |
//! | create | `create` | Never hooked, but the returned handle is |
//! | readdir/releasedir | | Served from the opendir snapshot |
//! | everything else | passthrough | |

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use hookfs::{Attr, Errno, FileKind, HookFile, HookFs, StatFs};
use libc::c_int;
use tracing::{debug, info, trace, warn};

use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use crate::executor::Executor;
use crate::handles::{FuseHandle, HandleTable};
use crate::inode::{InodeTable, ROOT_INODE};

/// Maps a backing-store node type to the FUSE wire type.
pub fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

/// Builds the attributes reported for inode `ino`.
///
/// The backing store's own inode number is discarded; FUSE only ever sees
/// numbers from the inode table.
pub fn file_attr(ino: u64, attr: &Attr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// How an extended-attribute value answers a request for `size` bytes.
#[derive(Debug, PartialEq, Eq)]
enum XattrReply<'a> {
    /// Size probe: report the length only.
    Size(u32),
    Data(&'a [u8]),
}

fn fit_xattr(size: u32, data: &[u8]) -> FuseResult<XattrReply<'_>> {
    let len = u32::try_from(data.len()).map_err(|_| Errno::E2BIG)?;
    if size == 0 {
        Ok(XattrReply::Size(len))
    } else if len > size {
        Err(Errno::ERANGE.into())
    } else {
        Ok(XattrReply::Data(data))
    }
}

fn reply_xattr(reply: ReplyXattr, size: u32, data: &[u8]) {
    match fit_xattr(size, data) {
        Ok(XattrReply::Size(len)) => reply.size(len),
        Ok(XattrReply::Data(data)) => reply.data(data),
        Err(e) => reply.error(e.to_errno()),
    }
}

/// State shared between the session thread and the workers.
struct Inner {
    fs: HookFs,
    inodes: InodeTable,
    handles: HandleTable,
    ttl: Duration,
}

impl Inner {
    fn path(&self, ino: u64) -> FuseResult<PathBuf> {
        self.inodes.path_of(ino).ok_or(FuseError::InvalidInode(ino))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<PathBuf> {
        if name.is_empty() || name.as_bytes().contains(&b'/') {
            return Err(FuseError::InvalidName(name.to_string_lossy().into_owned()));
        }
        self.inodes
            .child_path(parent, name)
            .ok_or(FuseError::InvalidInode(parent))
    }

    /// Stats `path` and counts a kernel lookup on its inode.
    fn entry(&self, path: &Path) -> FuseResult<FileAttr> {
        let attr = self.fs.getattr(path)?;
        let ino = self.inodes.get_or_insert(path);
        Ok(file_attr(ino, &attr))
    }

    fn getattr(&self, ino: u64, fh: Option<u64>) -> FuseResult<FileAttr> {
        let attr = match self.open_file(fh) {
            Some(file) => file.getattr()?,
            None => self.fs.getattr(&self.path(ino)?)?,
        };
        Ok(file_attr(ino, &attr))
    }

    /// The open file behind `fh`, if it names one.
    fn open_file(&self, fh: Option<u64>) -> Option<Arc<HookFile>> {
        fh.and_then(|fh| self.handles.file(fh).ok())
    }

    fn setattr(
        &self,
        ino: u64,
        fh: Option<u64>,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FuseResult<FileAttr> {
        let path = self.path(ino)?;
        let file = self.open_file(fh);
        if let Some(mode) = mode {
            match &file {
                Some(f) => f.chmod(mode)?,
                None => self.fs.chmod(&path, mode)?,
            }
        }
        if uid.is_some() || gid.is_some() {
            match &file {
                Some(f) => f.chown(uid, gid)?,
                None => self.fs.chown(&path, uid, gid)?,
            }
        }
        if let Some(size) = size {
            match &file {
                Some(f) => f.truncate(size)?,
                None => self.fs.truncate(&path, size)?,
            }
        }
        if atime.is_some() || mtime.is_some() {
            match &file {
                Some(f) => f.utimens(atime, mtime)?,
                None => self.fs.utimens(&path, atime, mtime)?,
            }
        }
        self.getattr(ino, fh)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> FuseResult<FileAttr> {
        self.fs.mkdir(path, mode)?;
        self.entry(path)
    }

    fn rmdir(&self, path: &Path) -> FuseResult<()> {
        self.fs.rmdir(path)?;
        self.inodes.invalidate_path(path);
        Ok(())
    }

    fn unlink(&self, path: &Path) -> FuseResult<()> {
        self.fs.unlink(path)?;
        self.inodes.invalidate_path(path);
        Ok(())
    }

    fn rename(&self, old: &Path, new: &Path) -> FuseResult<()> {
        self.fs.rename(old, new)?;
        self.inodes.rename(old, new);
        Ok(())
    }

    /// Opens `path` and registers the handle.
    ///
    /// A handle returned together with an error is released, since the
    /// reply can carry only one of them.
    fn open(&self, path: &Path, flags: i32) -> FuseResult<u64> {
        let opened = self.fs.open(path, flags);
        match (opened.file, opened.status) {
            (Some(file), Ok(())) => Ok(self.handles.insert(FuseHandle::File(Arc::new(file)))),
            (Some(file), Err(e)) => {
                debug!(path = %path.display(), error = %e, "Releasing handle opened with an error");
                file.release();
                Err(e.into())
            }
            (None, Err(e)) => Err(e.into()),
            (None, Ok(())) => {
                warn!(path = %path.display(), "Open reported success without a handle");
                Err(Errno::EIO.into())
            }
        }
    }

    fn create(&self, path: &Path, flags: i32, mode: u32) -> FuseResult<(FileAttr, u64)> {
        let file = self.fs.create(path, flags, mode)?;
        let attr = match file.getattr() {
            Ok(attr) => attr,
            Err(e) => {
                file.release();
                return Err(e.into());
            }
        };
        let ino = self.inodes.get_or_insert(path);
        let fh = self.handles.insert(FuseHandle::File(Arc::new(file)));
        Ok((file_attr(ino, &attr), fh))
    }

    /// Lists `path` once and keeps the listing as a directory handle.
    fn opendir(&self, ino: u64, path: &Path) -> FuseResult<u64> {
        let entries = self.fs.opendir(path)?;
        let parent_ino = path
            .parent()
            .and_then(|parent| self.inodes.get_inode(parent))
            .unwrap_or(ROOT_INODE);
        let handle = FuseHandle::dir(ino, parent_ino, entries, |entry| {
            // Listing does not count as a lookup
            self.inodes
                .get_or_insert_no_lookup_inc(&path.join(&entry.name))
        });
        Ok(self.handles.insert(handle))
    }

    fn read(&self, fh: u64, offset: i64, size: u32) -> FuseResult<Vec<u8>> {
        Ok(self.handles.file(fh)?.read(size, offset)?)
    }

    fn write(&self, fh: u64, offset: i64, data: &[u8]) -> FuseResult<u32> {
        Ok(self.handles.file(fh)?.write(data, offset)?)
    }

    fn fsync(&self, fh: u64, datasync: bool) -> FuseResult<()> {
        Ok(self.handles.file(fh)?.fsync(datasync)?)
    }

    fn release(&self, fh: u64) -> FuseResult<()> {
        match self.handles.remove(fh) {
            Some(FuseHandle::File(file)) => {
                file.release();
                Ok(())
            }
            Some(FuseHandle::Dir(_)) => Err(FuseError::WrongHandleType),
            None => Err(FuseError::InvalidHandle(fh)),
        }
    }

    fn statfs(&self, ino: u64) -> FuseResult<StatFs> {
        Ok(self.fs.statfs(&self.path(ino)?)?)
    }

    fn xattr_names(&self, ino: u64) -> FuseResult<Vec<u8>> {
        let names = self.fs.listxattr(&self.path(ino)?)?;
        let mut buf = Vec::new();
        for name in names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        Ok(buf)
    }
}

/// FUSE adapter serving a [`HookFs`].
///
/// Hooked operations run on a worker pool so a hook that sleeps holds up
/// only its own request.
pub struct HookFuse {
    inner: Arc<Inner>,
    executor: Executor,
    config: MountConfig,
}

impl HookFuse {
    pub fn new(fs: HookFs, config: MountConfig) -> FuseResult<Self> {
        let executor = Executor::new(config.io_threads, config.queue_capacity)?;
        let inner = Arc::new(Inner {
            fs,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            ttl: config.attr_ttl,
        });
        Ok(Self {
            inner,
            executor,
            config,
        })
    }

    pub fn hookfs(&self) -> &HookFs {
        &self.inner.fs
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Runs `job` against the shared state on the worker pool.
    fn offload<F>(&self, job: F)
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.executor.spawn(move || job(&inner));
    }
}

impl std::fmt::Debug for HookFuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookFuse")
            .field("fs", &self.inner.fs)
            .field("inodes", &self.inner.inodes.len())
            .field("handles", &self.inner.handles.len())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Filesystem for HookFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        self.inner.fs.on_mount();
        // Hooked reads reply from workers, possibly out of order
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        info!(fs = %self.inner.fs, "FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.executor.shutdown();
        self.inner.fs.on_unmount();
        info!("FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, ?name, "lookup");
        match self
            .inner
            .child_path(parent, name)
            .and_then(|path| self.inner.entry(&path))
        {
            Ok(attr) => reply.entry(&self.inner.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inner.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.inner.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, ?fh, "getattr");
        match self.inner.getattr(ino, fh) {
            Ok(attr) => reply.attr(&self.inner.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?mode, ?uid, ?gid, ?size, ?fh, "setattr");
        let result = self.inner.setattr(
            ino,
            fh,
            mode,
            uid,
            gid,
            size,
            atime.map(time_or_now),
            mtime.map(time_or_now),
        );
        match result {
            Ok(attr) => reply.attr(&self.inner.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        match self
            .inner
            .path(ino)
            .and_then(|path| Ok(self.inner.fs.readlink(&path)?))
        {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, mode, rdev, "mknod");
        let result = self.inner.child_path(parent, name).and_then(|path| {
            self.inner.fs.mknod(&path, mode & !umask, rdev)?;
            self.inner.entry(&path)
        });
        match result {
            Ok(attr) => reply.entry(&self.inner.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, mode, "mkdir");
        let path = match self.inner.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        self.offload(move |inner| match inner.mkdir(&path, mode & !umask) {
            Ok(attr) => reply.entry(&inner.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "unlink");
        match self
            .inner
            .child_path(parent, name)
            .and_then(|path| self.inner.unlink(&path))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "rmdir");
        let path = match self.inner.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        self.offload(move |inner| match inner.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?link_name, target = %target.display(), "symlink");
        let result = self.inner.child_path(parent, link_name).and_then(|path| {
            self.inner.fs.symlink(target, &path)?;
            self.inner.entry(&path)
        });
        match result {
            Ok(attr) => reply.entry(&self.inner.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, ?name, newparent, ?newname, flags, "rename");
        // RENAME_NOREPLACE and RENAME_EXCHANGE have no path-level equivalent
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let paths = self.inner.child_path(parent, name).and_then(|old| {
            let new = self.inner.child_path(newparent, newname)?;
            Ok((old, new))
        });
        let (old, new) = match paths {
            Ok(paths) => paths,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        self.offload(move |inner| match inner.rename(&old, &new) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        trace!(inode = ino, newparent, ?newname, "link");
        let result = self.inner.path(ino).and_then(|existing| {
            let link = self.inner.child_path(newparent, newname)?;
            self.inner.fs.link(&existing, &link)?;
            self.inner.entry(&link)
        });
        match result {
            Ok(attr) => reply.entry(&self.inner.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        let path = match self.inner.path(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        self.offload(move |inner| match inner.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        self.offload(move |inner| match inner.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, len = data.len(), "write");
        let data = data.to_vec();
        self.offload(move |inner| match inner.write(fh, offset, &data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        match self.inner.handles.file(fh).and_then(|f| Ok(f.flush()?)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        match self.inner.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, datasync, "fsync");
        self.offload(move |inner| match inner.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        let path = match self.inner.path(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        self.offload(move |inner| match inner.opendir(ino, &path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    /// Offsets are positions in the opendir snapshot, so a listing stays
    /// stable while the directory changes underneath.
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, fh, offset, "readdir");
        let slots = match self.inner.handles.dir(fh) {
            Ok(slots) => slots,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let start = usize::try_from(offset).unwrap_or(0);
        for (idx, slot) in slots.iter().enumerate().skip(start) {
            let next = i64::try_from(idx + 1).unwrap_or(i64::MAX);
            // `add` returns true once the reply buffer is full
            if reply.add(slot.ino, next, file_type(slot.kind), &slot.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "releasedir");
        match self.inner.handles.remove(fh) {
            Some(_) => reply.ok(),
            None => reply.error(FuseError::InvalidHandle(fh).to_errno()),
        }
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, datasync, "fsyncdir");
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        trace!(inode = ino, "statfs");
        match self.inner.statfs(ino) {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, ?name, len = value.len(), "setxattr");
        match self
            .inner
            .path(ino)
            .and_then(|path| Ok(self.inner.fs.setxattr(&path, name, value, flags)?))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        trace!(inode = ino, ?name, size, "getxattr");
        match self
            .inner
            .path(ino)
            .and_then(|path| Ok(self.inner.fs.getxattr(&path, name)?))
        {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        trace!(inode = ino, size, "listxattr");
        match self.inner.xattr_names(ino) {
            Ok(names) => reply_xattr(reply, size, &names),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(inode = ino, ?name, "removexattr");
        match self
            .inner
            .path(ino)
            .and_then(|path| Ok(self.inner.fs.removexattr(&path, name)?))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(inode = ino, mask, "access");
        match self
            .inner
            .path(ino)
            .and_then(|path| Ok(self.inner.fs.access(&path, mask)?))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, ?name, mode, flags, "create");
        match self
            .inner
            .child_path(parent, name)
            .and_then(|path| self.inner.create(&path, flags, mode & !umask))
        {
            Ok((attr, fh)) => reply.created(&self.inner.ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, offset, length, mode, "fallocate");
        let (Ok(offset), Ok(length)) = (u64::try_from(offset), u64::try_from(length)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self
            .inner
            .handles
            .file(fh)
            .and_then(|f| Ok(f.allocate(offset, length, mode)?))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookfs::{Hook, HookContext, HookFsConfig, OnOpen, OnRename, PostHook, PreHook};
    use tempfile::TempDir;

    fn inner_with(hook: Option<Arc<dyn Hook>>) -> (TempDir, Inner) {
        let dir = tempfile::tempdir().unwrap();
        let fs = HookFs::new(dir.path(), "/mnt/test", hook, HookFsConfig::default()).unwrap();
        fs.on_mount();
        let inner = Inner {
            fs,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            ttl: Duration::from_secs(1),
        };
        (dir, inner)
    }

    /// Lets the open through, then reports EACCES anyway.
    #[derive(Debug)]
    struct LateDenyOpen;

    impl Hook for LateDenyOpen {
        fn on_open(&self) -> Option<&dyn OnOpen> {
            Some(self)
        }
    }

    impl OnOpen for LateDenyOpen {
        fn pre_open(&self, _path: &Path, _flags: i32) -> PreHook {
            PreHook::proceed()
        }

        fn post_open(&self, _real: Result<(), Errno>, _ctx: HookContext) -> PostHook {
            PostHook::fail(Errno::EACCES)
        }
    }

    #[derive(Debug)]
    struct FailRename;

    impl Hook for FailRename {
        fn on_rename(&self) -> Option<&dyn OnRename> {
            Some(self)
        }
    }

    impl OnRename for FailRename {
        fn pre_rename(&self, _old: &Path, _new: &Path) -> PreHook {
            PreHook::fail(Errno::EIO)
        }
    }

    #[test]
    fn test_file_type_mapping() {
        assert_eq!(file_type(FileKind::File), FileType::RegularFile);
        assert_eq!(file_type(FileKind::Directory), FileType::Directory);
        assert_eq!(file_type(FileKind::Symlink), FileType::Symlink);
        assert_eq!(file_type(FileKind::NamedPipe), FileType::NamedPipe);
    }

    #[test]
    fn test_file_attr_uses_table_inode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"hello").unwrap();
        let meta = std::fs::symlink_metadata(dir.path().join("f")).unwrap();
        let attr = Attr::from_metadata(&meta);

        let fa = file_attr(42, &attr);
        assert_eq!(fa.ino, 42);
        assert_eq!(fa.size, 5);
        assert_eq!(fa.kind, FileType::RegularFile);
        assert_eq!(fa.crtime, attr.ctime);
    }

    #[test]
    fn test_fit_xattr() {
        assert_eq!(fit_xattr(0, b"abc").unwrap(), XattrReply::Size(3));
        assert_eq!(fit_xattr(8, b"abc").unwrap(), XattrReply::Data(b"abc"));
        assert_eq!(fit_xattr(2, b"abc").unwrap_err().to_errno(), libc::ERANGE);
    }

    #[test]
    fn test_entry_counts_lookup() {
        let (dir, inner) = inner_with(None);
        std::fs::write(dir.path().join("a"), b"").unwrap();

        let first = inner.entry(Path::new("a")).unwrap();
        let second = inner.entry(Path::new("a")).unwrap();
        assert_eq!(first.ino, second.ino);
        assert_eq!(inner.inodes.nlookup(first.ino), Some(2));
    }

    #[test]
    fn test_child_path_rejects_bad_names() {
        let (_dir, inner) = inner_with(None);
        assert!(matches!(
            inner.child_path(ROOT_INODE, OsStr::new("a/b")),
            Err(FuseError::InvalidName(_))
        ));
        assert!(matches!(
            inner.child_path(999, OsStr::new("a")),
            Err(FuseError::InvalidInode(999))
        ));
        assert_eq!(
            inner.child_path(ROOT_INODE, OsStr::new("a")).unwrap(),
            PathBuf::from("a")
        );
    }

    #[test]
    fn test_create_write_read_release() {
        let (dir, inner) = inner_with(None);
        let (attr, fh) = inner
            .create(Path::new("new.txt"), libc::O_RDWR, 0o644)
            .unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(inner.inodes.get_inode(Path::new("new.txt")), Some(attr.ino));

        assert_eq!(inner.write(fh, 0, b"hookfs").unwrap(), 6);
        assert_eq!(inner.read(fh, 0, 64).unwrap(), b"hookfs");
        inner.release(fh).unwrap();

        assert!(matches!(inner.read(fh, 0, 1), Err(FuseError::InvalidHandle(_))));
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"hookfs");
    }

    #[test]
    fn test_open_with_late_error_releases_handle() {
        let (dir, inner) = inner_with(Some(Arc::new(LateDenyOpen)));
        std::fs::write(dir.path().join("f"), b"x").unwrap();

        let err = inner.open(Path::new("f"), libc::O_RDONLY).unwrap_err();
        assert_eq!(err.to_errno(), libc::EACCES);
        assert!(inner.handles.is_empty());
    }

    #[test]
    fn test_opendir_snapshot() {
        let (dir, inner) = inner_with(None);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/one"), b"").unwrap();
        let sub = inner.entry(Path::new("sub")).unwrap().ino;

        let fh = inner.opendir(sub, Path::new("sub")).unwrap();
        // Later changes do not show up in an open listing
        std::fs::write(dir.path().join("sub/two"), b"").unwrap();

        let slots = inner.handles.dir(fh).unwrap();
        let names: Vec<_> = slots.iter().map(|s| s.name.to_string_lossy().into_owned()).collect();
        assert_eq!(names, [".", "..", "one"]);
        assert_eq!(slots[0].ino, sub);
        assert_eq!(slots[1].ino, ROOT_INODE);

        let one = inner.inodes.get_inode(Path::new("sub/one")).unwrap();
        assert_eq!(slots[2].ino, one);
        assert_eq!(inner.inodes.nlookup(one), Some(0));
    }

    #[test]
    fn test_rename_moves_inodes() {
        let (dir, inner) = inner_with(None);
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/f"), b"").unwrap();
        let child = inner.entry(Path::new("a/f")).unwrap().ino;

        inner.rename(Path::new("a"), Path::new("b")).unwrap();
        assert_eq!(inner.inodes.path_of(child), Some(PathBuf::from("b/f")));
        assert!(dir.path().join("b/f").exists());
    }

    #[test]
    fn test_failed_rename_keeps_inodes() {
        let (dir, inner) = inner_with(Some(Arc::new(FailRename)));
        std::fs::write(dir.path().join("old"), b"").unwrap();
        let ino = inner.entry(Path::new("old")).unwrap().ino;

        let err = inner.rename(Path::new("old"), Path::new("new")).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
        assert_eq!(inner.inodes.path_of(ino), Some(PathBuf::from("old")));
        assert!(dir.path().join("old").exists());
    }

    #[test]
    fn test_rmdir_invalidates_path() {
        let (dir, inner) = inner_with(None);
        std::fs::create_dir(dir.path().join("d")).unwrap();
        let ino = inner.entry(Path::new("d")).unwrap().ino;

        inner.rmdir(Path::new("d")).unwrap();
        assert!(inner.inodes.get_inode(Path::new("d")).is_none());
        assert!(inner.inodes.path_of(ino).is_some());
    }

    #[test]
    fn test_setattr_truncate_and_chmod() {
        let (dir, inner) = inner_with(None);
        std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
        let ino = inner.entry(Path::new("f")).unwrap().ino;

        let attr = inner
            .setattr(ino, None, Some(0o600), None, None, Some(4), None, None)
            .unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(attr.perm, 0o600);
    }

    #[test]
    fn test_statfs_unknown_inode() {
        let (_dir, inner) = inner_with(None);
        assert!(inner.statfs(ROOT_INODE).unwrap().blocks > 0);

        let err = inner.statfs(999).unwrap_err();
        assert!(matches!(err, FuseError::InvalidInode(999)));
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_xattr_names_are_nul_terminated() {
        let (dir, inner) = inner_with(None);
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let ino = inner.entry(Path::new("f")).unwrap().ino;

        // tmpfs and some CI filesystems reject user xattrs
        if inner
            .fs
            .setxattr(Path::new("f"), OsStr::new("user.hookfs"), b"1", 0)
            .is_err()
        {
            return;
        }
        let names = inner.xattr_names(ino).unwrap();
        assert!(names.ends_with(b"user.hookfs\0"));
    }
}
