//! The hooked filesystem façade.
//!
//! [`HookFs`] forwards every namespace operation to its backing [`PathFs`].
//! Open, mkdir, rmdir, opendir and rename go through the active hook first;
//! everything else passes straight through. Files opened through the façade
//! come back wrapped in a [`HookFile`] so their reads, writes and syncs are
//! hookable too.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::SystemTime;

use nix::errno::Errno;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::backing::{Attr, DirEntry, PathFs, StatFs};
use crate::config::HookFsConfig;
use crate::error::{HookFsError, HookFsResult, OrErrno};
use crate::file::HookFile;
use crate::hook::{Hook, HookContext, PostHook, PreHook};
use crate::intercept::{Op, Outcome, intercept, status};
use crate::loopback::LoopbackFs;

/// Result of [`HookFs::open`].
///
/// A post-hook may override the status of an open that already produced a
/// handle, so a handle can come back together with an error. Callers that
/// cannot return both must release the handle.
#[derive(Debug)]
pub struct Opened {
    pub file: Option<HookFile>,
    pub status: Result<(), Errno>,
}

impl Opened {
    /// The handle, if the open succeeded and produced one.
    ///
    /// A handle paired with an error is released before the error is returned.
    pub fn into_result(self) -> Result<HookFile, Errno> {
        match (self.file, self.status) {
            (Some(file), Ok(())) => Ok(file),
            (Some(file), Err(e)) => {
                file.release();
                Err(e)
            }
            (None, Err(e)) => Err(e),
            (None, Ok(())) => Err(Errno::EIO),
        }
    }
}

/// A filesystem that routes operations through a fault-injection hook.
pub struct HookFs {
    original: PathBuf,
    mountpoint: PathBuf,
    fs_name: String,
    fs: Box<dyn PathFs>,
    hook: RwLock<Option<Arc<dyn Hook>>>,
    config: HookFsConfig,
    init: Once,
}

impl HookFs {
    /// Hooks the directory `original`, to be served at `mountpoint`.
    pub fn new(
        original: impl Into<PathBuf>,
        mountpoint: impl Into<PathBuf>,
        hook: Option<Arc<dyn Hook>>,
        config: HookFsConfig,
    ) -> HookFsResult<Self> {
        let original = original.into();
        if !std::fs::metadata(&original)?.is_dir() {
            return Err(HookFsError::NotADirectory(original));
        }
        let backing = LoopbackFs::new(original.clone());
        Ok(Self::with_backing(Box::new(backing), original, mountpoint, hook, config))
    }

    /// Hooks an arbitrary backing store.
    pub fn with_backing(
        fs: Box<dyn PathFs>,
        original: impl Into<PathBuf>,
        mountpoint: impl Into<PathBuf>,
        hook: Option<Arc<dyn Hook>>,
        config: HookFsConfig,
    ) -> Self {
        let original = original.into();
        let mountpoint = mountpoint.into();
        debug!(
            original = %original.display(),
            mountpoint = %mountpoint.display(),
            "Hooking a fs"
        );
        fs.set_debug(config.log_level.is_debug());
        Self {
            original,
            mountpoint,
            fs_name: config.fs_name.clone(),
            fs,
            hook: RwLock::new(hook),
            config,
            init: Once::new(),
        }
    }

    pub fn original(&self) -> &Path {
        &self.original
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn fs_name(&self) -> &str {
        &self.fs_name
    }

    pub fn config(&self) -> &HookFsConfig {
        &self.config
    }

    /// The active hook. Cleared for good if its init fails.
    pub fn hook(&self) -> Option<Arc<dyn Hook>> {
        self.hook.read().clone()
    }

    pub fn is_hooked(&self) -> bool {
        self.hook.read().is_some()
    }

    /// Mount-time setup: the backing store first, then the hook's init.
    ///
    /// Init runs at most once per façade, however often this is called.
    pub fn on_mount(&self) {
        self.fs.on_mount();
        self.init.call_once(|| {
            let Some(hook) = self.hook() else {
                return;
            };
            let Some(init) = hook.init_hook() else {
                return;
            };
            if let Err(e) = init.init() {
                error!(error = %e, hook = ?hook, "Hook init failed");
                warn!("Disabling hook");
                *self.hook.write() = None;
            } else {
                info!(hook = ?hook, "Hook initialized");
            }
        });
    }

    pub fn on_unmount(&self) {
        self.fs.on_unmount();
    }

    pub fn set_debug(&self, debug: bool) {
        self.fs.set_debug(debug);
    }

    pub fn getattr(&self, path: &Path) -> Result<Attr, Errno> {
        self.fs.getattr(path).or_errno()
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<(), Errno> {
        self.fs.chmod(path, mode).or_errno()
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
        self.fs.chown(path, uid, gid).or_errno()
    }

    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), Errno> {
        self.fs.utimens(path, atime, mtime).or_errno()
    }

    pub fn truncate(&self, path: &Path, size: u64) -> Result<(), Errno> {
        self.fs.truncate(path, size).or_errno()
    }

    pub fn access(&self, path: &Path, mask: i32) -> Result<(), Errno> {
        self.fs.access(path, mask).or_errno()
    }

    pub fn link(&self, existing: &Path, link: &Path) -> Result<(), Errno> {
        self.fs.link(existing, link).or_errno()
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<(), Errno> {
        let hook = self.hook();
        intercept(
            Op::Mkdir,
            path,
            hook.as_deref().and_then(Hook::on_mkdir),
            |h| h.pre_mkdir(path, mode),
            || self.fs.mkdir(path, mode).or_errno(),
            |h, real, ctx| h.post_mkdir(*real, ctx),
        )
        .into_status()
    }

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<(), Errno> {
        self.fs.mknod(path, mode, rdev).or_errno()
    }

    /// Renames `old` to `new`.
    ///
    /// Looser than the other hooked operations. Only a pre-hook failure
    /// stops the rename; a short-circuit without an error still renames and
    /// still reaches the post-hook. A post-hook override only wins when it
    /// carries an error.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<(), Errno> {
        let hook = self.hook();
        let cap = hook.as_deref().and_then(Hook::on_rename);

        let ctx = match cap.map(|h| h.pre_rename(old, new)) {
            None => HookContext::empty(),
            Some(PreHook::Proceed(ctx)) => ctx,
            Some(PreHook::ShortCircuit { error, .. }) => {
                debug!(op = "Rename", old = %old.display(), new = %new.display(), ?error, "Prehooked");
                if let Some(e) = error {
                    return Err(e);
                }
                HookContext::empty()
            }
        };

        let real = self.fs.rename(old, new).or_errno();

        if let Some(h) = cap
            && let PostHook::Override { error, .. } = h.post_rename(old, new, real, ctx)
        {
            debug!(op = "Rename", old = %old.display(), new = %new.display(), ?error, "Posthooked");
            if let Some(e) = error {
                return Err(e);
            }
        }

        real
    }

    pub fn rmdir(&self, path: &Path) -> Result<(), Errno> {
        let hook = self.hook();
        intercept(
            Op::Rmdir,
            path,
            hook.as_deref().and_then(Hook::on_rmdir),
            |h| h.pre_rmdir(path),
            || self.fs.rmdir(path).or_errno(),
            |h, real, ctx| h.post_rmdir(*real, ctx),
        )
        .into_status()
    }

    pub fn unlink(&self, path: &Path) -> Result<(), Errno> {
        self.fs.unlink(path).or_errno()
    }

    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        self.fs.getxattr(path, name).or_errno()
    }

    pub fn listxattr(&self, path: &Path) -> Result<Vec<OsString>, Errno> {
        self.fs.listxattr(path).or_errno()
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<(), Errno> {
        self.fs.removexattr(path, name).or_errno()
    }

    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<(), Errno> {
        self.fs.setxattr(path, name, value, flags).or_errno()
    }

    /// Opens `path`, wrapping the backing file before the post-hook runs.
    pub fn open(&self, path: &Path, flags: i32) -> Opened {
        let hook = self.hook();
        let outcome = intercept(
            Op::Open,
            path,
            hook.as_deref().and_then(Hook::on_open),
            |h| h.pre_open(path, flags),
            || {
                self.fs
                    .open(path, flags)
                    .map(|file| HookFile::new(file, path, hook.clone()))
                    .or_errno()
            },
            |h, real, ctx| h.post_open(real.as_ref().map(|_| ()).map_err(|e| *e), ctx),
        );
        match outcome {
            Outcome::ShortCircuit { error, .. } => Opened {
                file: None,
                status: status(error),
            },
            Outcome::Delegated(Ok(file)) => Opened {
                file: Some(file),
                status: Ok(()),
            },
            Outcome::Delegated(Err(e)) => Opened {
                file: None,
                status: Err(e),
            },
            Outcome::Overridden { real, error, .. } => Opened {
                file: real.ok(),
                status: status(error),
            },
        }
    }

    /// Creates and opens `path`. Never hooked, but the returned file is.
    pub fn create(&self, path: &Path, flags: i32, mode: u32) -> Result<HookFile, Errno> {
        self.fs
            .create(path, flags, mode)
            .map(|file| HookFile::new(file, path, self.hook()))
            .or_errno()
    }

    pub fn opendir(&self, path: &Path) -> Result<Vec<DirEntry>, Errno> {
        let hook = self.hook();
        let outcome = intercept(
            Op::OpenDir,
            path,
            hook.as_deref().and_then(Hook::on_opendir),
            |h| h.pre_opendir(path),
            || self.fs.opendir(path).or_errno(),
            |h, real, ctx| h.post_opendir(real.as_ref().map(|_| ()).map_err(|e| *e), ctx),
        );
        match outcome {
            Outcome::Delegated(real) => real,
            Outcome::ShortCircuit { error, .. } => status(error).map(|()| Vec::new()),
            Outcome::Overridden { real, error, .. } => {
                status(error).map(|()| real.unwrap_or_default())
            }
        }
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> Result<(), Errno> {
        self.fs.symlink(target, link).or_errno()
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf, Errno> {
        self.fs.readlink(path).or_errno()
    }

    pub fn statfs(&self, path: &Path) -> Result<StatFs, Errno> {
        self.fs.statfs(path).or_errno()
    }
}

impl fmt::Display for HookFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HookFs{{Original={}, Mountpoint={}, FsName={}, Underlying fs={}, hook={:?}}}",
            self.original.display(),
            self.mountpoint.display(),
            self.fs_name,
            self.fs.name(),
            &*self.hook.read(),
        )
    }
}

impl fmt::Debug for HookFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookFs")
            .field("original", &self.original)
            .field("mountpoint", &self.mountpoint)
            .field("fs_name", &self.fs_name)
            .field("fs", &self.fs)
            .field("hooked", &self.is_hooked())
            .finish_non_exhaustive()
    }
}
