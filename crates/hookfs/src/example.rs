//! A probabilistic fault-injection hook.
//!
//! [`RandomFaultHook`] implements every capability except rename. Each
//! decision rolls against a percentage from [`FaultProbabilities`]; the
//! defaults reproduce the classic hookfs demo policy.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::hook::{
    Hook, HookContext, HookWithInit, OnFsync, OnMkdir, OnOpen, OnOpenDir, OnRead, OnRmdir,
    OnWrite, PostHook, PreHook,
};

/// Buffer substituted for real read results.
pub const INJECTED_DATA: &[u8] = b"Hello HookFS hooked Data!\n";

/// Default delay for the sleep faults.
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(3);

/// Chance, in percent, of each fault firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultProbabilities {
    pub open_eio: u32,
    pub post_open_eperm: u32,
    pub read_sleep: u32,
    pub post_read_inject: u32,
    pub write_sleep: u32,
    pub post_write_enospc: u32,
    pub mkdir_eacces: u32,
    pub post_mkdir_eperm: u32,
    pub rmdir_eacces: u32,
    pub post_rmdir_eperm: u32,
    pub opendir_eacces: u32,
    pub post_opendir_eperm: u32,
    pub fsync_sleep: u32,
    pub post_fsync_eio: u32,
}

impl Default for FaultProbabilities {
    fn default() -> Self {
        Self {
            open_eio: 5,
            post_open_eperm: 5,
            read_sleep: 3,
            post_read_inject: 70,
            write_sleep: 3,
            post_write_enospc: 70,
            mkdir_eacces: 95,
            post_mkdir_eperm: 5,
            rmdir_eacces: 30,
            post_rmdir_eperm: 30,
            opendir_eacces: 30,
            post_opendir_eperm: 30,
            fsync_sleep: 90,
            post_fsync_eio: 80,
        }
    }
}

impl FaultProbabilities {
    /// Every fault disabled.
    pub fn none() -> Self {
        Self {
            open_eio: 0,
            post_open_eperm: 0,
            read_sleep: 0,
            post_read_inject: 0,
            write_sleep: 0,
            post_write_enospc: 0,
            mkdir_eacces: 0,
            post_mkdir_eperm: 0,
            rmdir_eacces: 0,
            post_rmdir_eperm: 0,
            opendir_eacces: 0,
            post_opendir_eperm: 0,
            fsync_sleep: 0,
            post_fsync_eio: 0,
        }
    }
}

/// Per-call context: the path the pre-hook saw.
#[derive(Debug, Clone)]
struct FaultContext {
    path: PathBuf,
}

impl FaultContext {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

fn is_root(ctx: &HookContext) -> bool {
    ctx.get::<FaultContext>()
        .is_none_or(|c| c.path.as_os_str().is_empty())
}

pub struct RandomFaultHook {
    odds: FaultProbabilities,
    sleep: Duration,
    rng: Mutex<StdRng>,
}

impl RandomFaultHook {
    pub fn new() -> Self {
        Self::with_rng(FaultProbabilities::default(), StdRng::from_os_rng())
    }

    /// Deterministic sequence of decisions for a given seed.
    pub fn seeded(odds: FaultProbabilities, seed: u64) -> Self {
        Self::with_rng(odds, StdRng::seed_from_u64(seed))
    }

    fn with_rng(odds: FaultProbabilities, rng: StdRng) -> Self {
        Self {
            odds,
            sleep: DEFAULT_SLEEP,
            rng: Mutex::new(rng),
        }
    }

    #[must_use]
    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn odds(&self) -> &FaultProbabilities {
        &self.odds
    }

    fn roll(&self, percent: u32) -> bool {
        self.rng.lock().random_range(0..99) < percent
    }

    fn nap(&self, op: &str, path: &Path) {
        info!(op, path = %path.display(), sleep = ?self.sleep, "sleeping");
        thread::sleep(self.sleep);
    }

    fn inject(&self, op: &str, path: &Path, error: Errno) -> PreHook {
        info!(op, path = %path.display(), %error, "returning error");
        PreHook::fail(error)
    }

    fn inject_post(&self, op: &str, ctx: &HookContext, error: Errno) -> PostHook {
        info!(op, ctx = ?ctx.get::<FaultContext>(), %error, "returning error");
        PostHook::fail(error)
    }
}

impl Default for RandomFaultHook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RandomFaultHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomFaultHook")
            .field("odds", &self.odds)
            .field("sleep", &self.sleep)
            .finish_non_exhaustive()
    }
}

impl Hook for RandomFaultHook {
    fn init_hook(&self) -> Option<&dyn HookWithInit> {
        Some(self)
    }

    fn on_open(&self) -> Option<&dyn OnOpen> {
        Some(self)
    }

    fn on_read(&self) -> Option<&dyn OnRead> {
        Some(self)
    }

    fn on_write(&self) -> Option<&dyn OnWrite> {
        Some(self)
    }

    fn on_mkdir(&self) -> Option<&dyn OnMkdir> {
        Some(self)
    }

    fn on_rmdir(&self) -> Option<&dyn OnRmdir> {
        Some(self)
    }

    fn on_opendir(&self) -> Option<&dyn OnOpenDir> {
        Some(self)
    }

    fn on_fsync(&self) -> Option<&dyn OnFsync> {
        Some(self)
    }
}

impl HookWithInit for RandomFaultHook {
    fn init(&self) -> anyhow::Result<()> {
        info!(hook = ?self, "initializing");
        Ok(())
    }
}

impl OnOpen for RandomFaultHook {
    fn pre_open(&self, path: &Path, _flags: i32) -> PreHook {
        if self.roll(self.odds.open_eio) {
            return self.inject("open", path, Errno::EIO);
        }
        PreHook::proceed_with(FaultContext::new(path))
    }

    fn post_open(&self, _real: Result<(), Errno>, ctx: HookContext) -> PostHook {
        if self.roll(self.odds.post_open_eperm) {
            return self.inject_post("open", &ctx, Errno::EPERM);
        }
        PostHook::Keep
    }
}

impl OnRead for RandomFaultHook {
    fn pre_read(&self, path: &Path, _size: u32, _offset: i64) -> PreHook<Vec<u8>> {
        if self.roll(self.odds.read_sleep) {
            self.nap("read", path);
        }
        PreHook::proceed_with(FaultContext::new(path))
    }

    fn post_read(&self, _real: Result<&[u8], Errno>, ctx: HookContext) -> PostHook<Vec<u8>> {
        if self.roll(self.odds.post_read_inject) {
            info!(op = "read", ctx = ?ctx.get::<FaultContext>(), "returning injected buffer");
            return PostHook::reply(INJECTED_DATA.to_vec());
        }
        PostHook::Keep
    }
}

impl OnWrite for RandomFaultHook {
    fn pre_write(&self, path: &Path, _data: &[u8], _offset: i64) -> PreHook {
        if self.roll(self.odds.write_sleep) {
            self.nap("write", path);
        }
        PreHook::proceed_with(FaultContext::new(path))
    }

    fn post_write(&self, _real: Result<u32, Errno>, ctx: HookContext) -> PostHook {
        if self.roll(self.odds.post_write_enospc) {
            return self.inject_post("write", &ctx, Errno::ENOSPC);
        }
        PostHook::Keep
    }
}

impl OnMkdir for RandomFaultHook {
    fn pre_mkdir(&self, path: &Path, _mode: u32) -> PreHook {
        if self.roll(self.odds.mkdir_eacces) {
            return self.inject("mkdir", path, Errno::EACCES);
        }
        PreHook::proceed_with(FaultContext::new(path))
    }

    fn post_mkdir(&self, _real: Result<(), Errno>, ctx: HookContext) -> PostHook {
        if self.roll(self.odds.post_mkdir_eperm) {
            return self.inject_post("mkdir", &ctx, Errno::EPERM);
        }
        PostHook::Keep
    }
}

impl OnRmdir for RandomFaultHook {
    fn pre_rmdir(&self, path: &Path) -> PreHook {
        if self.roll(self.odds.rmdir_eacces) {
            return self.inject("rmdir", path, Errno::EACCES);
        }
        PreHook::proceed_with(FaultContext::new(path))
    }

    fn post_rmdir(&self, _real: Result<(), Errno>, ctx: HookContext) -> PostHook {
        if self.roll(self.odds.post_rmdir_eperm) {
            return self.inject_post("rmdir", &ctx, Errno::EPERM);
        }
        PostHook::Keep
    }
}

// The root directory is never failed, so the mount stays listable.
impl OnOpenDir for RandomFaultHook {
    fn pre_opendir(&self, path: &Path) -> PreHook {
        if self.roll(self.odds.opendir_eacces) && !path.as_os_str().is_empty() {
            return self.inject("opendir", path, Errno::EACCES);
        }
        PreHook::proceed_with(FaultContext::new(path))
    }

    fn post_opendir(&self, _real: Result<(), Errno>, ctx: HookContext) -> PostHook {
        if self.roll(self.odds.post_opendir_eperm) && !is_root(&ctx) {
            return self.inject_post("opendir", &ctx, Errno::EPERM);
        }
        PostHook::Keep
    }
}

impl OnFsync for RandomFaultHook {
    fn pre_fsync(&self, path: &Path, _datasync: bool) -> PreHook {
        if self.roll(self.odds.fsync_sleep) && !path.as_os_str().is_empty() {
            self.nap("fsync", path);
        }
        PreHook::proceed_with(FaultContext::new(path))
    }

    fn post_fsync(&self, _real: Result<(), Errno>, ctx: HookContext) -> PostHook {
        if self.roll(self.odds.post_fsync_eio) && !is_root(&ctx) {
            return self.inject_post("fsync", &ctx, Errno::EIO);
        }
        PostHook::Keep
    }
}
