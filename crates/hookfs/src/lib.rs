//! Fault-injection hooks for path-addressed filesystems.
//!
//! [`HookFs`] sits between a filesystem protocol engine and a backing store
//! and lets a [`Hook`] observe, delay, mutate or replace the outcome of
//! open, read, write, mkdir, rmdir, opendir, fsync and rename. Every other
//! operation goes to the backing store untouched.
//!
//! # Protocol
//!
//! Each hooked operation runs in up to three steps:
//!
//! 1. The pre-hook sees the call's arguments. [`PreHook::ShortCircuit`]
//!    ends the call here with the hook's result.
//! 2. The backing store runs the real operation.
//! 3. The post-hook sees the real result. [`PostHook::Override`] replaces it.
//!
//! A [`HookContext`] returned by the pre-hook is handed to the post-hook of
//! the same call and then dropped.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use hookfs::{HookFs, HookFsConfig, RandomFaultHook};
//!
//! let hook = Arc::new(RandomFaultHook::new());
//! let fs = HookFs::new("/srv/data", "/mnt/faulty", Some(hook), HookFsConfig::default())?;
//! fs.on_mount();
//! ```

pub mod backing;
pub mod config;
pub mod error;
pub mod example;
pub mod file;
pub mod fs;
pub mod hook;
mod intercept;
pub mod loopback;

pub use backing::{Attr, DirEntry, FileKind, LowerFile, PathFs, StatFs};
pub use config::{DEFAULT_FS_NAME, HookFsConfig, LogLevel};
pub use error::{HookFsError, HookFsResult, OrErrno, ToErrno, io_error_to_errno, status_of};
pub use example::{FaultProbabilities, RandomFaultHook};
pub use file::HookFile;
pub use fs::{HookFs, Opened};
pub use hook::{
    Hook, HookContext, HookWithInit, OnFsync, OnMkdir, OnOpen, OnOpenDir, OnRead, OnRename,
    OnRmdir, OnWrite, PostHook, PreHook,
};
pub use loopback::{LoopbackFile, LoopbackFs};
pub use nix::errno::Errno;
