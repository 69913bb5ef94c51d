//! Mount configuration for the FUSE adapter.

use std::time::Duration;

use crate::executor::{DEFAULT_IO_THREADS, DEFAULT_QUEUE_CAPACITY};

/// Entry and attribute TTL handed to the kernel (1 second).
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Configuration options for a hookfs mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Time-to-live for entries and attributes cached by the kernel.
    ///
    /// Default: 1 second.
    pub attr_ttl: Duration,

    /// Worker threads running hooked operations.
    ///
    /// Each in-flight request occupies one worker, so a sleeping hook only
    /// stalls its own request. Default: 16.
    pub io_threads: usize,

    /// Capacity of the worker queue. Requests beyond it run on the
    /// session thread. Default: 1024.
    pub queue_capacity: usize,

    /// Let users other than the mounting user access the mount.
    pub allow_other: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            io_threads: DEFAULT_IO_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            allow_other: false,
        }
    }
}

impl MountConfig {
    /// Sets the kernel cache TTL for entries and attributes.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the number of worker threads. Zero is raised to one.
    #[must_use]
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads.max(1);
        self
    }

    /// Sizes the worker pool to the machine's CPU count.
    #[must_use]
    pub fn io_threads_per_cpu(self) -> Self {
        self.io_threads(num_cpus::get())
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn allow_other(mut self, allow: bool) -> Self {
        self.allow_other = allow;
        self
    }
}
