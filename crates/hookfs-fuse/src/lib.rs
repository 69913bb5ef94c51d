//! FUSE mount for hookfs fault-injecting filesystems.
//!
//! This crate serves a [`hookfs::HookFs`] through the kernel's FUSE
//! interface, so unmodified programs see the faults a hook injects.
//!
//! # Features
//!
//! - Inode table over the façade's path-addressed operations
//! - Hooked operations run on a worker pool; a sleeping hook stalls only its
//!   own request
//! - Directory listings snapshotted at opendir
//! - Bounded mount and unmount waits
//!
//! # Usage
//!
//! ```ignore
//! use hookfs::{HookFs, HookFsConfig};
//! use hookfs_fuse::{MountConfig, mount};
//!
//! let fs = HookFs::new("/srv/data", "/mnt/faulty", Some(hook), HookFsConfig::default())?;
//! let handle = mount(fs, MountConfig::default())?;
//! // ...
//! handle.unmount();
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod mount;

pub use config::{DEFAULT_ATTR_TTL, MountConfig};
pub use error::{FuseError, FuseResult, ToErrno};
pub use executor::{Executor, ExecutorError, ExecutorStats};
pub use filesystem::HookFuse;
pub use handles::{DirSlot, FuseHandle, HandleTable};
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
pub use mount::{FuseMounter, MountHandle, fuse_available, mount, mount_options};
