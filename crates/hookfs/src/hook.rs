//! Hook capability model.
//!
//! A hook is any value implementing [`Hook`]. Each hookable operation family
//! is a separate capability trait ([`OnOpen`], [`OnRead`], ...). A hook opts
//! into a capability by implementing the trait and overriding the matching
//! accessor on [`Hook`] to return `Some(self)`:
//!
//! ```
//! use std::path::Path;
//! use hookfs::{Errno, Hook, OnOpen, PreHook};
//!
//! #[derive(Debug)]
//! struct DenyOpen;
//!
//! impl Hook for DenyOpen {
//!     fn on_open(&self) -> Option<&dyn OnOpen> {
//!         Some(self)
//!     }
//! }
//!
//! impl OnOpen for DenyOpen {
//!     fn pre_open(&self, _path: &Path, _flags: i32) -> PreHook {
//!         PreHook::fail(Errno::EACCES)
//!     }
//! }
//! ```
//!
//! Capabilities are probed independently at every call site, so a hook that
//! only implements [`OnRead`] leaves every other operation untouched.

use std::any::Any;
use std::fmt;
use std::path::Path;

use nix::errno::Errno;

/// Opaque value handed from a pre-hook to its matching post-hook.
///
/// A context lives for exactly one invocation. It is moved out of the
/// pre-hook result and into the post-hook call, and cannot be cloned.
#[derive(Default)]
pub struct HookContext(Option<Box<dyn Any + Send>>);

impl HookContext {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    /// A context carrying nothing.
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Borrows the carried value if it is a `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_ref()?.downcast_ref::<T>()
    }

    /// Consumes the context, returning the carried value if it is a `T`.
    pub fn take<T: Any>(self) -> Option<T> {
        self.0?.downcast::<T>().ok().map(|b| *b)
    }
}

impl fmt::Debug for HookContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("HookContext(empty)")
        } else {
            f.write_str("HookContext { .. }")
        }
    }
}

/// Outcome of a pre-hook.
///
/// `D` is the data a short-circuit hands back in place of the real call:
/// the read buffer for [`OnRead`], nothing for every other operation.
#[derive(Debug)]
pub enum PreHook<D = ()> {
    /// Run the real operation, then the post-hook with this context.
    Proceed(HookContext),
    /// Skip the real operation and the post-hook entirely.
    ShortCircuit { data: D, error: Option<Errno> },
}

impl<D> PreHook<D> {
    pub fn proceed() -> Self {
        PreHook::Proceed(HookContext::empty())
    }

    pub fn proceed_with<T: Any + Send>(ctx: T) -> Self {
        PreHook::Proceed(HookContext::new(ctx))
    }

    pub fn is_short_circuit(&self) -> bool {
        matches!(self, PreHook::ShortCircuit { .. })
    }
}

impl<D: Default> PreHook<D> {
    /// Skip the real operation and report `error`.
    pub fn fail(error: Errno) -> Self {
        PreHook::ShortCircuit {
            data: D::default(),
            error: Some(error),
        }
    }

    /// Skip the real operation and report success.
    ///
    /// Not allowed for open, mkdir, rmdir and opendir: there is no result a
    /// hook could fabricate for those, and the filesystem treats it as a
    /// fatal contract violation.
    pub fn succeed() -> Self {
        PreHook::ShortCircuit {
            data: D::default(),
            error: None,
        }
    }
}

impl PreHook<Vec<u8>> {
    /// Skip the real read and return `data` instead.
    pub fn reply(data: Vec<u8>) -> Self {
        PreHook::ShortCircuit { data, error: None }
    }
}

/// Outcome of a post-hook.
#[derive(Debug)]
pub enum PostHook<D = ()> {
    /// Return the real operation's result unchanged.
    Keep,
    /// Discard the real result and return this instead.
    Override { data: D, error: Option<Errno> },
}

impl<D> PostHook<D> {
    pub fn is_override(&self) -> bool {
        matches!(self, PostHook::Override { .. })
    }
}

impl<D: Default> PostHook<D> {
    pub fn fail(error: Errno) -> Self {
        PostHook::Override {
            data: D::default(),
            error: Some(error),
        }
    }

    pub fn succeed() -> Self {
        PostHook::Override {
            data: D::default(),
            error: None,
        }
    }
}

impl PostHook<Vec<u8>> {
    pub fn reply(data: Vec<u8>) -> Self {
        PostHook::Override { data, error: None }
    }
}

/// A fault-injection policy attached to a mounted filesystem.
///
/// Every accessor defaults to `None`. Override the ones for the
/// capabilities the hook implements.
pub trait Hook: Send + Sync + fmt::Debug {
    fn init_hook(&self) -> Option<&dyn HookWithInit> {
        None
    }

    fn on_open(&self) -> Option<&dyn OnOpen> {
        None
    }

    fn on_read(&self) -> Option<&dyn OnRead> {
        None
    }

    fn on_write(&self) -> Option<&dyn OnWrite> {
        None
    }

    fn on_mkdir(&self) -> Option<&dyn OnMkdir> {
        None
    }

    fn on_rmdir(&self) -> Option<&dyn OnRmdir> {
        None
    }

    fn on_opendir(&self) -> Option<&dyn OnOpenDir> {
        None
    }

    fn on_fsync(&self) -> Option<&dyn OnFsync> {
        None
    }

    fn on_rename(&self) -> Option<&dyn OnRename> {
        None
    }
}

/// Called once when the filesystem is mounted.
///
/// An error disables the hook for the rest of the mount's lifetime.
pub trait HookWithInit: Send + Sync {
    fn init(&self) -> anyhow::Result<()>;
}

pub trait OnOpen: Send + Sync {
    fn pre_open(&self, path: &Path, flags: i32) -> PreHook;

    fn post_open(&self, _real: Result<(), Errno>, _ctx: HookContext) -> PostHook {
        PostHook::Keep
    }
}

pub trait OnRead: Send + Sync {
    /// `PreHook::reply` supplies the bytes returned in place of the real read.
    fn pre_read(&self, path: &Path, size: u32, offset: i64) -> PreHook<Vec<u8>>;

    /// `real` carries the bytes the backing store returned.
    fn post_read(&self, _real: Result<&[u8], Errno>, _ctx: HookContext) -> PostHook<Vec<u8>> {
        PostHook::Keep
    }
}

pub trait OnWrite: Send + Sync {
    fn pre_write(&self, path: &Path, data: &[u8], offset: i64) -> PreHook;

    /// `real` carries the number of bytes the backing store wrote.
    fn post_write(&self, _real: Result<u32, Errno>, _ctx: HookContext) -> PostHook {
        PostHook::Keep
    }
}

pub trait OnMkdir: Send + Sync {
    fn pre_mkdir(&self, path: &Path, mode: u32) -> PreHook;

    fn post_mkdir(&self, _real: Result<(), Errno>, _ctx: HookContext) -> PostHook {
        PostHook::Keep
    }
}

pub trait OnRmdir: Send + Sync {
    fn pre_rmdir(&self, path: &Path) -> PreHook;

    fn post_rmdir(&self, _real: Result<(), Errno>, _ctx: HookContext) -> PostHook {
        PostHook::Keep
    }
}

pub trait OnOpenDir: Send + Sync {
    fn pre_opendir(&self, path: &Path) -> PreHook;

    fn post_opendir(&self, _real: Result<(), Errno>, _ctx: HookContext) -> PostHook {
        PostHook::Keep
    }
}

pub trait OnFsync: Send + Sync {
    fn pre_fsync(&self, path: &Path, datasync: bool) -> PreHook;

    fn post_fsync(&self, _real: Result<(), Errno>, _ctx: HookContext) -> PostHook {
        PostHook::Keep
    }
}

/// Rename hooks follow a looser protocol than the other operations: a
/// short-circuit only stops the rename when it carries an error, and an
/// override only replaces the result when it carries an error.
pub trait OnRename: Send + Sync {
    fn pre_rename(&self, old: &Path, new: &Path) -> PreHook;

    fn post_rename(
        &self,
        _old: &Path,
        _new: &Path,
        _real: Result<(), Errno>,
        _ctx: HookContext,
    ) -> PostHook {
        PostHook::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(&'static str);

    #[test]
    fn test_context_roundtrip() {
        let ctx = HookContext::new(Marker("open"));
        assert_eq!(ctx.get::<Marker>(), Some(&Marker("open")));
        assert_eq!(ctx.take::<Marker>(), Some(Marker("open")));
    }

    #[test]
    fn test_context_wrong_type() {
        let ctx = HookContext::new(42_u32);
        assert!(ctx.get::<String>().is_none());
        assert!(ctx.take::<String>().is_none());
    }

    #[test]
    fn test_empty_context() {
        let ctx = HookContext::default();
        assert!(ctx.is_empty());
        assert!(ctx.get::<u32>().is_none());
        assert_eq!(format!("{ctx:?}"), "HookContext(empty)");
    }

    #[test]
    fn test_prehook_helpers() {
        let pre: PreHook = PreHook::fail(Errno::EIO);
        assert!(matches!(
            pre,
            PreHook::ShortCircuit {
                error: Some(Errno::EIO),
                ..
            }
        ));

        let pre: PreHook<Vec<u8>> = PreHook::reply(b"abc".to_vec());
        match pre {
            PreHook::ShortCircuit { data, error } => {
                assert_eq!(data, b"abc");
                assert!(error.is_none());
            }
            PreHook::Proceed(_) => panic!("expected short-circuit"),
        }

        let pre: PreHook = PreHook::proceed_with(Marker("x"));
        assert!(!pre.is_short_circuit());
    }

    #[test]
    fn test_posthook_helpers() {
        let post: PostHook = PostHook::fail(Errno::EPERM);
        assert!(post.is_override());
        assert!(!PostHook::<()>::Keep.is_override());
    }

    #[derive(Debug)]
    struct Bare;
    impl Hook for Bare {}

    #[test]
    fn test_bare_hook_has_no_capabilities() {
        let hook = Bare;
        assert!(hook.init_hook().is_none());
        assert!(hook.on_open().is_none());
        assert!(hook.on_read().is_none());
        assert!(hook.on_write().is_none());
        assert!(hook.on_mkdir().is_none());
        assert!(hook.on_rmdir().is_none());
        assert!(hook.on_opendir().is_none());
        assert!(hook.on_fsync().is_none());
        assert!(hook.on_rename().is_none());
    }
}
