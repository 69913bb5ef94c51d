//! Mounting a [`HookFs`] with fuser.
//!
//! [`FuseMounter::mount`] spawns a background FUSE session serving a
//! [`HookFuse`], waits until the kernel reports the mountpoint as a distinct
//! filesystem and hands back a [`MountHandle`]. The handle unmounts on drop.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use fuser::{BackgroundSession, MountOption};
use hookfs::HookFs;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use crate::filesystem::HookFuse;

/// Timeout for a graceful `session.join()` before forcing the unmount.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Subtype reported in the mount table (`fuse.hookfs`).
pub const SUBTYPE: &str = "hookfs";

/// Whether this system can serve FUSE mounts at all.
pub fn fuse_available() -> bool {
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
    }
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        false
    }
}

/// Mount options for serving `fs`.
///
/// The source column of the mount table shows the absolute original
/// directory.
pub fn mount_options(fs: &HookFs, config: &MountConfig) -> Vec<MountOption> {
    let source = std::path::absolute(fs.original()).unwrap_or_else(|_| fs.original().to_path_buf());
    let mut options = vec![
        MountOption::FSName(source.display().to_string()),
        MountOption::Subtype(SUBTYPE.to_string()),
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Handle to a mounted hookfs.
///
/// Dropping the handle unmounts the filesystem.
pub struct MountHandle {
    session: Mutex<Option<BackgroundSession>>,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Whether the session is still being served.
    pub fn is_mounted(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Unmounts and waits for the session to finish.
    ///
    /// Calling this again after the filesystem is unmounted does nothing.
    pub fn unmount(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        info!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem");
        session.join();
        info!(mountpoint = %self.mountpoint.display(), "FUSE unmount successful");
    }

    /// Unmounts with system tools, for when the session is stuck on busy handles.
    fn force_unmount(&self) {
        #[cfg(target_os = "macos")]
        {
            let _ = std::process::Command::new("umount")
                .arg("-f")
                .arg(&self.mountpoint)
                .output();
        }

        #[cfg(target_os = "linux")]
        {
            let _ = std::process::Command::new("fusermount")
                .args(["-uz"])
                .arg(&self.mountpoint)
                .output();
        }
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.get_mut().take() else {
            return;
        };
        debug!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem on drop");

        // join() blocks while files are open, so bound it
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            session.join();
            let _ = tx.send(());
        });

        match rx.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) => debug!(mountpoint = %self.mountpoint.display(), "Graceful unmount completed"),
            Err(_) => {
                warn!(
                    mountpoint = %self.mountpoint.display(),
                    timeout = ?JOIN_TIMEOUT,
                    "session.join() timed out, forcing unmount"
                );
                self.force_unmount();
            }
        }
    }
}

/// Mounts hookfs filesystems with bounded waits.
#[derive(Debug, Clone, Copy)]
pub struct FuseMounter {
    /// Timeout for the mount call and for the mount becoming ready.
    pub mount_timeout: Duration,
    /// Polling interval while waiting for the mount.
    pub poll_interval: Duration,
}

impl Default for FuseMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FuseMounter {
    pub fn new() -> Self {
        Self {
            mount_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_timeouts(mount_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            mount_timeout,
            poll_interval,
        }
    }

    /// Serves `fs` at its mountpoint until the returned handle is unmounted.
    pub fn mount(&self, fs: HookFs, config: MountConfig) -> FuseResult<MountHandle> {
        if !fuse_available() {
            return Err(FuseError::Mount(io::Error::new(
                io::ErrorKind::NotFound,
                "FUSE is not available on this system",
            )));
        }

        let mountpoint = fs.mountpoint().to_path_buf();
        if !mountpoint.is_dir() {
            return Err(FuseError::Mount(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mountpoint {} is not a directory", mountpoint.display()),
            )));
        }

        let options = mount_options(&fs, &config);
        info!(
            original = %fs.original().display(),
            mountpoint = %mountpoint.display(),
            hooked = fs.is_hooked(),
            "Starting FUSE mount"
        );

        let filesystem = HookFuse::new(fs, config)?;
        let session = self.spawn_mount_with_timeout(filesystem, &mountpoint, &options)?;
        let handle = MountHandle {
            session: Mutex::new(Some(session)),
            mountpoint,
        };

        // Dropping the handle on failure tears the session back down
        self.wait_for_mount(&handle.mountpoint)?;
        info!(mountpoint = %handle.mountpoint.display(), "FUSE mount ready");
        Ok(handle)
    }

    /// Runs `spawn_mount2` on its own thread, since the mount syscall can
    /// block on a stale mount at the mountpoint.
    fn spawn_mount_with_timeout(
        &self,
        fs: HookFuse,
        mountpoint: &Path,
        options: &[MountOption],
    ) -> FuseResult<BackgroundSession> {
        let mountpoint = mountpoint.to_path_buf();
        let options = options.to_vec();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let _ = tx.send(fuser::spawn_mount2(fs, &mountpoint, &options));
        });

        match rx.recv_timeout(self.mount_timeout) {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(FuseError::Mount(e)),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(FuseError::Mount(io::Error::new(
                io::ErrorKind::TimedOut,
                "Mount operation timed out - the mountpoint may be on a stale FUSE mount",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(FuseError::Mount(io::Error::other(
                "Mount thread terminated unexpectedly",
            ))),
        }
    }

    /// Polls until the mountpoint's device ID differs from its parent's.
    fn wait_for_mount(&self, mountpoint: &Path) -> FuseResult<()> {
        use std::os::unix::fs::MetadataExt;

        let deadline = Instant::now() + self.mount_timeout;
        let parent = mountpoint.parent().unwrap_or(Path::new("/"));

        while Instant::now() < deadline {
            if let (Ok(path_meta), Ok(parent_meta)) =
                (std::fs::metadata(mountpoint), std::fs::metadata(parent))
                && path_meta.dev() != parent_meta.dev()
            {
                debug!(
                    mountpoint = %mountpoint.display(),
                    dev = path_meta.dev(),
                    parent_dev = parent_meta.dev(),
                    "FUSE mount confirmed active"
                );
                return Ok(());
            }
            std::thread::sleep(self.poll_interval);
        }

        Err(FuseError::Mount(io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "FUSE mount did not become ready within {:?}",
                self.mount_timeout
            ),
        )))
    }
}

/// Mounts `fs` with the default timeouts.
pub fn mount(fs: HookFs, config: MountConfig) -> FuseResult<MountHandle> {
    FuseMounter::new().mount(fs, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookfs::HookFsConfig;

    fn hookfs_at(original: &Path) -> HookFs {
        HookFs::new(original, "/mnt/unused", None, HookFsConfig::default()).unwrap()
    }

    #[test]
    fn test_mount_options_report_original() {
        let dir = tempfile::tempdir().unwrap();
        let fs = hookfs_at(dir.path());

        let options = mount_options(&fs, &MountConfig::default());
        assert_eq!(options.len(), 2);
        assert!(matches!(
            &options[0],
            MountOption::FSName(name) if Path::new(name) == dir.path()
        ));
        assert!(matches!(&options[1], MountOption::Subtype(s) if s == "hookfs"));
    }

    #[test]
    fn test_mount_options_allow_other() {
        let dir = tempfile::tempdir().unwrap();
        let fs = hookfs_at(dir.path());

        let options = mount_options(&fs, &MountConfig::default().allow_other(true));
        assert!(options.contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_mount_rejects_missing_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HookFs::new(
            dir.path(),
            dir.path().join("does-not-exist"),
            None,
            HookFsConfig::default(),
        )
        .unwrap();

        let mounter = FuseMounter::with_timeouts(Duration::from_millis(200), Duration::from_millis(10));
        let err = mounter.mount(fs, MountConfig::default()).unwrap_err();
        assert!(matches!(err, FuseError::Mount(_)));
    }
}
