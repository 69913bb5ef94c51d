//! Loopback backing store: every operation goes straight to a host directory.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt as _, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use filetime::FileTime;
use fs2::FileExt;
#[cfg(target_os = "linux")]
use nix::fcntl::FallocateFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::backing::{Attr, DirEntry, FileKind, LowerFile, PathFs, StatFs};

/// A [`PathFs`] rooted at a directory on the host.
pub struct LoopbackFs {
    root: PathBuf,
    debug: AtomicBool,
}

impl LoopbackFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debug: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for LoopbackFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackFs").field("root", &self.root).finish()
    }
}

/// Status for a missing extended attribute.
#[cfg(target_os = "macos")]
const NO_XATTR: i32 = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const NO_XATTR: i32 = libc::ENODATA;

/// Splits `flags` into std open options. The access mode goes through
/// `read`/`write`, everything else through `custom_flags`.
fn open_options(flags: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => opts.write(true),
        libc::O_RDWR => opts.read(true).write(true),
        _ => opts.read(true),
    };
    opts.custom_flags(flags & !libc::O_ACCMODE);
    opts
}

fn set_times(path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
    if let Some(atime) = atime {
        filetime::set_file_atime(path, FileTime::from_system_time(atime))?;
    }
    if let Some(mtime) = mtime {
        filetime::set_file_mtime(path, FileTime::from_system_time(mtime))?;
    }
    Ok(())
}

impl PathFs for LoopbackFs {
    fn name(&self) -> String {
        format!("LoopbackFs({})", self.root.display())
    }

    fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    fn on_mount(&self) {
        debug!(root = %self.root.display(), "Loopback backing store mounted");
    }

    fn getattr(&self, path: &Path) -> io::Result<Attr> {
        if self.debug_enabled() {
            trace!(path = %path.display(), "loopback getattr");
        }
        fs::symlink_metadata(self.full_path(path)).map(|m| Attr::from_metadata(&m))
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.full_path(path), Permissions::from_mode(mode))
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        std::os::unix::fs::lchown(self.full_path(path), uid, gid)
    }

    fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()> {
        set_times(&self.full_path(path), atime, mtime)
    }

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        let len = libc::off_t::try_from(size).map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
        nix::unistd::truncate(&self.full_path(path), len)?;
        Ok(())
    }

    fn access(&self, path: &Path, mask: i32) -> io::Result<()> {
        nix::unistd::access(&self.full_path(path), AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }

    fn link(&self, existing: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(self.full_path(existing), self.full_path(link))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().mode(mode).create(self.full_path(path))
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> io::Result<()> {
        let kind = SFlag::from_bits_truncate((mode & u32::from(libc::S_IFMT)) as libc::mode_t);
        let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);
        nix::sys::stat::mknod(&self.full_path(path), kind, perm, rdev as libc::dev_t)?;
        Ok(())
    }

    fn rename(&self, old: &Path, new: &Path) -> io::Result<()> {
        fs::rename(self.full_path(old), self.full_path(new))
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.full_path(path))
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.full_path(path))
    }

    // The xattr crate's plain calls act on a symlink itself, not its target.
    fn getxattr(&self, path: &Path, name: &OsStr) -> io::Result<Vec<u8>> {
        xattr::get(self.full_path(path), name)?.ok_or_else(|| io::Error::from_raw_os_error(NO_XATTR))
    }

    fn listxattr(&self, path: &Path) -> io::Result<Vec<OsString>> {
        Ok(xattr::list(self.full_path(path))?.collect())
    }

    fn removexattr(&self, path: &Path, name: &OsStr) -> io::Result<()> {
        xattr::remove(self.full_path(path), name)
    }

    /// `flags` takes `XATTR_CREATE` or `XATTR_REPLACE` as for `setxattr(2)`.
    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
        let full = self.full_path(path);
        if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
            let exists = xattr::get(&full, name)?.is_some();
            if exists && flags & libc::XATTR_CREATE != 0 {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            if !exists && flags & libc::XATTR_REPLACE != 0 {
                return Err(io::Error::from_raw_os_error(NO_XATTR));
            }
        }
        xattr::set(&full, name, value)
    }

    fn open(&self, path: &Path, flags: i32) -> io::Result<Box<dyn LowerFile>> {
        let full = self.full_path(path);
        let file = open_options(flags).open(&full)?;
        Ok(Box::new(LoopbackFile::new(file, full)))
    }

    fn create(&self, path: &Path, flags: i32, mode: u32) -> io::Result<Box<dyn LowerFile>> {
        let full = self.full_path(path);
        let file = open_options(flags | libc::O_CREAT).mode(mode).open(&full)?;
        Ok(Box::new(LoopbackFile::new(file, full)))
    }

    fn opendir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        fs::read_dir(self.full_path(path))?
            .map(|entry| {
                let entry = entry?;
                Ok(DirEntry::new(entry.file_name(), FileKind::from(entry.file_type()?)))
            })
            .collect()
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.full_path(link))
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.full_path(path))
    }

    fn statfs(&self, path: &Path) -> io::Result<StatFs> {
        let stat = nix::sys::statvfs::statvfs(&self.full_path(path))?;
        Ok(StatFs {
            blocks: u64::from(stat.blocks()),
            bfree: u64::from(stat.blocks_free()),
            bavail: u64::from(stat.blocks_available()),
            files: u64::from(stat.files()),
            ffree: u64::from(stat.files_free()),
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        })
    }
}

/// An open host file.
pub struct LoopbackFile {
    file: RwLock<Option<File>>,
    path: PathBuf,
}

impl LoopbackFile {
    pub fn new(file: File, path: PathBuf) -> Self {
        Self {
            file: RwLock::new(Some(file)),
            path,
        }
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        let guard = self.file.read();
        let file = guard
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        f(file)
    }
}

fn offset_of(offset: i64) -> io::Result<u64> {
    u64::try_from(offset).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

impl LowerFile for LoopbackFile {
    fn read(&self, size: u32, offset: i64) -> io::Result<Vec<u8>> {
        let offset = offset_of(offset)?;
        self.with_file(|file| {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    fn write(&self, data: &[u8], offset: i64) -> io::Result<u32> {
        let offset = offset_of(offset)?;
        self.with_file(|file| {
            let written = u32::try_from(data.len()).map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
            file.write_all_at(data, offset)?;
            Ok(written)
        })
    }

    fn flush(&self) -> io::Result<()> {
        // Writes go straight to the host file; there is no buffer to drain.
        self.with_file(|_| Ok(()))
    }

    fn release(&self) {
        self.file.write().take();
    }

    fn fsync(&self, datasync: bool) -> io::Result<()> {
        self.with_file(|file| if datasync { file.sync_data() } else { file.sync_all() })
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.with_file(|file| file.set_len(size))
    }

    fn getattr(&self) -> io::Result<Attr> {
        self.with_file(|file| file.metadata().map(|m| Attr::from_metadata(&m)))
    }

    fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        self.with_file(|file| std::os::unix::fs::fchown(file, uid, gid))
    }

    fn chmod(&self, mode: u32) -> io::Result<()> {
        self.with_file(|file| file.set_permissions(Permissions::from_mode(mode)))
    }

    fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
        self.with_file(|file| {
            filetime::set_file_handle_times(
                file,
                atime.map(FileTime::from_system_time),
                mtime.map(FileTime::from_system_time),
            )
        })
    }

    #[cfg(target_os = "linux")]
    fn allocate(&self, offset: u64, size: u64, mode: i32) -> io::Result<()> {
        let offset = libc::off_t::try_from(offset).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let len = libc::off_t::try_from(size).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let flags = FallocateFlags::from_bits_truncate(mode);
        self.with_file(|file| Ok(nix::fcntl::fallocate(file, flags, offset, len)?))
    }

    #[cfg(not(target_os = "linux"))]
    fn allocate(&self, _offset: u64, _size: u64, _mode: i32) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
    }

    fn flock(&self, operation: i32) -> io::Result<()> {
        let nonblocking = operation & libc::LOCK_NB != 0;
        self.with_file(|file| match operation & !libc::LOCK_NB {
            libc::LOCK_UN => FileExt::unlock(file),
            libc::LOCK_SH if nonblocking => FileExt::try_lock_shared(file),
            libc::LOCK_SH => FileExt::lock_shared(file),
            libc::LOCK_EX if nonblocking => FileExt::try_lock_exclusive(file),
            libc::LOCK_EX => FileExt::lock_exclusive(file),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        })
    }
}

impl fmt::Display for LoopbackFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopbackFile({})", self.path.display())
    }
}

impl fmt::Debug for LoopbackFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackFile")
            .field("path", &self.path)
            .field("open", &self.file.read().is_some())
            .finish()
    }
}
