//! The backing-store seam.
//!
//! [`PathFs`] is the path-addressed filesystem a [`HookFs`](crate::HookFs)
//! forwards to, and [`LowerFile`] is one open file inside it. Paths are
//! relative to the backing root; the empty path names the root itself.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{FileType, Metadata};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Type of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    NamedPipe,
    Socket,
}

impl FileKind {
    /// Decodes the `S_IFMT` bits of a mode. Unknown types read as regular files.
    pub fn from_mode(mode: u32) -> Self {
        match mode & u32::from(libc::S_IFMT) {
            m if m == u32::from(libc::S_IFDIR) => FileKind::Directory,
            m if m == u32::from(libc::S_IFLNK) => FileKind::Symlink,
            m if m == u32::from(libc::S_IFBLK) => FileKind::BlockDevice,
            m if m == u32::from(libc::S_IFCHR) => FileKind::CharDevice,
            m if m == u32::from(libc::S_IFIFO) => FileKind::NamedPipe,
            m if m == u32::from(libc::S_IFSOCK) => FileKind::Socket,
            _ => FileKind::File,
        }
    }
}

impl From<FileType> for FileKind {
    fn from(ft: FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::NamedPipe
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::File
        }
    }
}

/// Attributes of a filesystem node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileKind,
    /// Permission bits only, without the file type.
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl Attr {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            ino: meta.ino(),
            size: meta.size(),
            blocks: meta.blocks(),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
            kind: FileKind::from(meta.file_type()),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: u32::try_from(meta.blksize()).unwrap_or(4096),
        }
    }
}

/// Converts `stat` seconds and nanoseconds to a `SystemTime`.
pub(crate) fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = u32::try_from(nsecs).unwrap_or(0);
    match u64::try_from(secs) {
        Ok(secs) => UNIX_EPOCH + Duration::new(secs, nanos),
        Err(_) => UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::new(0, nanos),
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn new(name: impl Into<OsString>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// A path-addressed filesystem.
pub trait PathFs: Send + Sync + fmt::Debug {
    /// Human-readable name of this filesystem.
    fn name(&self) -> String;

    fn set_debug(&self, debug: bool);

    fn on_mount(&self) {}

    fn on_unmount(&self) {}

    fn getattr(&self, path: &Path) -> io::Result<Attr>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    /// `None` leaves the corresponding timestamp unchanged.
    fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()>;

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()>;

    fn access(&self, path: &Path, mask: i32) -> io::Result<()>;

    /// Creates `link` as a hard link to the existing `existing`.
    fn link(&self, existing: &Path, link: &Path) -> io::Result<()>;

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> io::Result<()>;

    fn rename(&self, old: &Path, new: &Path) -> io::Result<()>;

    fn rmdir(&self, path: &Path) -> io::Result<()>;

    fn unlink(&self, path: &Path) -> io::Result<()>;

    fn getxattr(&self, path: &Path, name: &OsStr) -> io::Result<Vec<u8>>;

    fn listxattr(&self, path: &Path) -> io::Result<Vec<OsString>>;

    fn removexattr(&self, path: &Path, name: &OsStr) -> io::Result<()>;

    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()>;

    fn open(&self, path: &Path, flags: i32) -> io::Result<Box<dyn LowerFile>>;

    fn create(&self, path: &Path, flags: i32, mode: u32) -> io::Result<Box<dyn LowerFile>>;

    /// Lists a directory, without `.` and `..`.
    fn opendir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Creates `link` pointing at `target`. The target is stored verbatim.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    fn readlink(&self, path: &Path) -> io::Result<PathBuf>;

    fn statfs(&self, path: &Path) -> io::Result<StatFs>;
}

/// An open file inside a [`PathFs`].
///
/// Implementations are shared between concurrent requests on the same
/// handle, so every method takes `&self`.
pub trait LowerFile: Send + Sync + fmt::Debug + fmt::Display {
    /// Reads up to `size` bytes at `offset`. Short reads mean end of file.
    fn read(&self, size: u32, offset: i64) -> io::Result<Vec<u8>>;

    /// Writes `data` at `offset`, returning the number of bytes written.
    fn write(&self, data: &[u8], offset: i64) -> io::Result<u32>;

    fn flush(&self) -> io::Result<()>;

    /// Closes the file. Later calls fail with `EBADF`.
    fn release(&self);

    fn fsync(&self, datasync: bool) -> io::Result<()>;

    fn truncate(&self, size: u64) -> io::Result<()>;

    fn getattr(&self) -> io::Result<Attr>;

    fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    fn chmod(&self, mode: u32) -> io::Result<()>;

    fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()>;

    fn allocate(&self, offset: u64, size: u64, mode: i32) -> io::Result<()>;

    /// Advisory whole-file lock, `operation` as for `flock(2)`.
    fn flock(&self, operation: i32) -> io::Result<()>;

    /// The file this one wraps, if any.
    fn inner(&self) -> Option<&dyn LowerFile> {
        None
    }
}
