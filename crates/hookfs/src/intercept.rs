//! The pre-hook / delegate / post-hook dispatch shared by every hooked
//! operation except rename.

use std::fmt;
use std::path::Path;

use nix::errno::Errno;
use tracing::{debug, error};

use crate::hook::{HookContext, PostHook, PreHook};

/// Operation families dispatched through [`intercept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Open,
    Read,
    Write,
    Mkdir,
    Rmdir,
    OpenDir,
    Fsync,
}

impl Op {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Op::Open => "Open",
            Op::Read => "Read",
            Op::Write => "Write",
            Op::Mkdir => "Mkdir",
            Op::Rmdir => "Rmdir",
            Op::OpenDir => "OpenDir",
            Op::Fsync => "Fsync",
        }
    }

    /// Operations whose pre-hook may only short-circuit with an error.
    pub(crate) fn requires_error(self) -> bool {
        matches!(self, Op::Open | Op::Mkdir | Op::Rmdir | Op::OpenDir)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one intercepted call.
#[derive(Debug)]
pub(crate) enum Outcome<T, D> {
    /// The pre-hook short-circuited; the delegate never ran.
    ShortCircuit { data: D, error: Option<Errno> },
    /// The delegate ran and its result stands.
    Delegated(T),
    /// The delegate ran, then the post-hook replaced its result.
    Overridden { real: T, data: D, error: Option<Errno> },
}

impl<D> Outcome<Result<(), Errno>, D> {
    /// Status of an operation that returns nothing but a status.
    pub(crate) fn into_status(self) -> Result<(), Errno> {
        match self {
            Outcome::Delegated(real) => real,
            Outcome::ShortCircuit { error, .. } | Outcome::Overridden { error, .. } => status(error),
        }
    }
}

/// Runs `delegate` between the capability's pre- and post-hook.
///
/// With no capability the delegate runs alone. A short-circuit skips both
/// the delegate and the post-hook. The post-hook sees the delegate's result
/// by reference and runs at most once.
///
/// # Panics
///
/// Panics when the pre-hook of an operation that [`Op::requires_error`]
/// short-circuits without an error.
pub(crate) fn intercept<C, T, D>(
    op: Op,
    path: &Path,
    capability: Option<&C>,
    pre: impl FnOnce(&C) -> PreHook<D>,
    delegate: impl FnOnce() -> T,
    post: impl FnOnce(&C, &T, HookContext) -> PostHook<D>,
) -> Outcome<T, D>
where
    C: ?Sized,
{
    let Some(cap) = capability else {
        return Outcome::Delegated(delegate());
    };

    let ctx = match pre(cap) {
        PreHook::Proceed(ctx) => ctx,
        PreHook::ShortCircuit { data, error } => {
            debug!(op = op.name(), path = %path.display(), ?error, "Prehooked");
            if error.is_none() && op.requires_error() {
                error!(
                    op = op.name(),
                    path = %path.display(),
                    "Pre-hook short-circuited without an error"
                );
                panic!("{op} pre-hook short-circuited without an error");
            }
            return Outcome::ShortCircuit { data, error };
        }
    };

    let real = delegate();

    match post(cap, &real, ctx) {
        PostHook::Keep => Outcome::Delegated(real),
        PostHook::Override { data, error } => {
            debug!(op = op.name(), path = %path.display(), ?error, "Posthooked");
            Outcome::Overridden { real, data, error }
        }
    }
}

/// Folds an optional hook error into a status.
pub(crate) fn status(error: Option<Errno>) -> Result<(), Errno> {
    error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct Probe;

    fn run(
        op: Op,
        pre: PreHook,
        post: PostHook,
        delegated: &Cell<u32>,
        posted: &Cell<u32>,
    ) -> Outcome<Result<(), Errno>, ()> {
        let mut post = Some(post);
        intercept(
            op,
            Path::new("a/b"),
            Some(&Probe),
            |_| pre,
            || {
                delegated.set(delegated.get() + 1);
                Ok(())
            },
            |_, _, _| {
                posted.set(posted.get() + 1);
                post.take().unwrap_or(PostHook::Keep)
            },
        )
    }

    #[test]
    fn test_no_capability_delegates() {
        let calls = Cell::new(0);
        let outcome: Outcome<u32, ()> = intercept(
            Op::Read,
            Path::new("f"),
            None::<&Probe>,
            |_| unreachable!(),
            || {
                calls.set(calls.get() + 1);
                7
            },
            |_, _, _| unreachable!(),
        );
        assert!(matches!(outcome, Outcome::Delegated(7)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_short_circuit_skips_delegate_and_post() {
        let (d, p) = (Cell::new(0), Cell::new(0));
        let outcome = run(Op::Mkdir, PreHook::fail(Errno::EACCES), PostHook::Keep, &d, &p);
        assert!(matches!(
            outcome,
            Outcome::ShortCircuit {
                error: Some(Errno::EACCES),
                ..
            }
        ));
        assert_eq!((d.get(), p.get()), (0, 0));
    }

    #[test]
    fn test_proceed_runs_delegate_then_post_once() {
        let (d, p) = (Cell::new(0), Cell::new(0));
        let outcome = run(Op::Rmdir, PreHook::proceed(), PostHook::Keep, &d, &p);
        assert!(matches!(outcome, Outcome::Delegated(Ok(()))));
        assert_eq!((d.get(), p.get()), (1, 1));
    }

    #[test]
    fn test_post_override_wins() {
        let (d, p) = (Cell::new(0), Cell::new(0));
        let outcome = run(
            Op::Fsync,
            PreHook::proceed(),
            PostHook::fail(Errno::EIO),
            &d,
            &p,
        );
        assert!(matches!(
            outcome,
            Outcome::Overridden {
                real: Ok(()),
                error: Some(Errno::EIO),
                ..
            }
        ));
    }

    #[test]
    fn test_context_reaches_post() {
        let outcome: Outcome<(), ()> = intercept(
            Op::Write,
            Path::new("f"),
            Some(&Probe),
            |_| PreHook::proceed_with("token"),
            || (),
            |_, _, ctx| {
                assert_eq!(ctx.take::<&str>(), Some("token"));
                PostHook::Keep
            },
        );
        assert!(matches!(outcome, Outcome::Delegated(())));
    }

    #[test]
    fn test_write_may_short_circuit_without_error() {
        let (d, p) = (Cell::new(0), Cell::new(0));
        let outcome = run(Op::Write, PreHook::succeed(), PostHook::Keep, &d, &p);
        assert!(matches!(outcome, Outcome::ShortCircuit { error: None, .. }));
        assert_eq!(d.get(), 0);
    }

    #[test]
    #[should_panic(expected = "short-circuited without an error")]
    fn test_opendir_short_circuit_without_error_is_fatal() {
        let (d, p) = (Cell::new(0), Cell::new(0));
        let _ = run(Op::OpenDir, PreHook::succeed(), PostHook::Keep, &d, &p);
    }

    #[test]
    fn test_status() {
        assert_eq!(status(None), Ok(()));
        assert_eq!(status(Some(Errno::ENOSPC)), Err(Errno::ENOSPC));
    }
}
