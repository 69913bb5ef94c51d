//! Test mount harness for FUSE integration tests.
//!
//! Provides `TestMount`, which serves a temporary backing directory through
//! a hooked FUSE mount and unmounts it on drop.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hookfs::{Hook, HookFs, HookFsConfig};
use hookfs_fuse::{FuseMounter, MountConfig, MountHandle};
use tempfile::TempDir;

/// How long to wait for mount to become ready.
const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait between mount readiness checks.
const MOUNT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A hooked mount over a fresh temporary directory.
///
/// # Example
///
/// ```ignore
/// use common::TestMount;
///
/// #[test]
/// fn test_write_read() {
///     let mount = TestMount::new(None).unwrap();
///     mount.write("test.txt", b"hello").unwrap();
///     assert_eq!(mount.read("test.txt").unwrap(), b"hello");
/// }
/// ```
pub struct TestMount {
    /// The mount (unmounts on drop). Declared first so it drops before the dirs.
    handle: MountHandle,
    /// Path where the filesystem is mounted.
    pub mount_path: PathBuf,
    /// Backing directory served through the mount.
    pub backing_path: PathBuf,
    _temp: TempDir,
}

impl TestMount {
    /// Mount an empty backing directory with `hook` installed.
    pub fn new(hook: Option<Arc<dyn Hook>>) -> Result<Self, String> {
        Self::with_setup(hook, |_| Ok(()))
    }

    /// Like [`new`](Self::new), running `setup` on the backing directory first.
    pub fn with_setup(
        hook: Option<Arc<dyn Hook>>,
        setup: impl FnOnce(&std::path::Path) -> io::Result<()>,
    ) -> Result<Self, String> {
        let temp = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let backing_path = temp.path().join("original");
        let mount_path = temp.path().join("mnt");
        fs::create_dir(&backing_path).map_err(|e| format!("Failed to create backing dir: {e}"))?;
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;
        setup(&backing_path).map_err(|e| format!("Backing setup failed: {e}"))?;

        let fs = HookFs::new(&backing_path, &mount_path, hook, HookFsConfig::default())
            .map_err(|e| format!("Failed to create HookFs: {e}"))?;

        // Zero TTL so every check goes back through the hooks
        let config = MountConfig::default()
            .attr_ttl(Duration::ZERO)
            .io_threads(4);
        let handle = FuseMounter::with_timeouts(MOUNT_READY_TIMEOUT, MOUNT_CHECK_INTERVAL)
            .mount(fs, config)
            .map_err(|e| format!("Failed to mount: {e}"))?;

        Ok(Self {
            handle,
            mount_path,
            backing_path,
            _temp: temp,
        })
    }

    pub fn unmount(&self) {
        self.handle.unmount();
    }

    // =========================================================================
    // Filesystem convenience methods
    // =========================================================================

    /// Build a full path inside the mount.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.mount_path.join(relative.trim_start_matches('/'))
    }

    /// Build a full path inside the backing directory.
    pub fn backing(&self, relative: &str) -> PathBuf {
        self.backing_path.join(relative.trim_start_matches('/'))
    }

    /// Read a file's contents.
    pub fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut content = Vec::new();
        File::open(self.path(path))?.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Write content to a file (creates or overwrites).
    pub fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = File::create(self.path(path))?;
        file.write_all(content)?;
        Ok(())
    }

    /// Write content and fsync it.
    pub fn write_synced(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = File::create(self.path(path))?;
        file.write_all(content)?;
        file.sync_all()
    }

    pub fn mkdir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.path(path))
    }

    pub fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.path(path))
    }

    pub fn rmdir(&self, path: &str) -> io::Result<()> {
        fs::remove_dir(self.path(path))
    }

    pub fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.path(from), self.path(to))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.path(path).exists()
    }

    pub fn metadata(&self, path: &str) -> io::Result<Metadata> {
        fs::metadata(self.path(path))
    }

    /// List directory entries (names only, sorted).
    pub fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.path(path))?
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    #[cfg(unix)]
    pub fn symlink(&self, target: &str, link_path: &str) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.path(link_path))
    }

    pub fn read_link(&self, path: &str) -> io::Result<PathBuf> {
        fs::read_link(self.path(path))
    }

    pub fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(self.path(path))?;
        file.set_len(size)
    }
}

/// Check if FUSE is available on this system.
pub fn fuse_available() -> bool {
    hookfs_fuse::fuse_available()
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::harness::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}
