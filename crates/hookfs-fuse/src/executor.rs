//! Bounded worker pool for hooked operations.
//!
//! FUSE callbacks arrive on the session thread. Hooked operations may sleep
//! for seconds inside a hook, so they are handed to this pool and reply
//! from a worker, leaving the session thread free for other requests.
//!
//! # Design
//!
//! - Fixed number of worker threads (`io_threads`)
//! - Bounded submission queue
//! - A job that finds the queue full runs inline on the caller's thread
//!   rather than being dropped, since every FUSE request needs a reply

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, error, info, trace, warn};

/// Default number of I/O worker threads.
pub const DEFAULT_IO_THREADS: usize = 16;

/// Default capacity of the submission queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Error starting the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to spawn executor worker {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: io::Error,
    },
}

/// Statistics for the executor.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    /// Jobs queued to a worker.
    pub jobs_submitted: AtomicU64,
    /// Jobs a worker finished.
    pub jobs_completed: AtomicU64,
    /// Jobs run on the caller's thread because the queue was full.
    pub jobs_inline: AtomicU64,
}

impl ExecutorStats {
    pub fn submitted(&self) -> u64 {
        self.jobs_submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn inline(&self) -> u64 {
        self.jobs_inline.load(Ordering::Relaxed)
    }
}

/// A fixed pool of worker threads fed by a bounded queue.
pub struct Executor {
    submit_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<ExecutorStats>,
    queue_capacity: usize,
}

impl Executor {
    pub fn new(io_threads: usize, queue_capacity: usize) -> Result<Self, ExecutorError> {
        let io_threads = io_threads.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (submit_tx, submit_rx) = bounded::<Job>(queue_capacity);
        let stats = Arc::new(ExecutorStats::default());

        let mut workers = Vec::with_capacity(io_threads);
        for worker_id in 0..io_threads {
            let rx = submit_rx.clone();
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("hookfs-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &rx, &stats))
                .map_err(|source| ExecutorError::Spawn { worker_id, source })?;
            workers.push(handle);
        }

        info!(
            threads = io_threads,
            capacity = queue_capacity,
            "Executor started"
        );

        Ok(Self {
            submit_tx: Some(submit_tx),
            workers,
            stats,
            queue_capacity,
        })
    }

    /// Runs `job` on a worker, or inline if the queue is full.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(tx) = &self.submit_tx else {
            job();
            return;
        };
        match tx.try_send(Box::new(job)) {
            Ok(()) => {
                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                trace!("Job submitted to executor");
            }
            Err(TrySendError::Full(job)) => {
                self.stats.jobs_inline.fetch_add(1, Ordering::Relaxed);
                warn!(
                    capacity = self.queue_capacity,
                    "Executor queue full, running request inline"
                );
                job();
            }
            Err(TrySendError::Disconnected(job)) => {
                error!("Executor channel disconnected, running request inline");
                self.stats.jobs_inline.fetch_add(1, Ordering::Relaxed);
                job();
            }
        }
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    pub fn io_threads(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub fn shutdown(&mut self) {
        if self.submit_tx.take().is_none() {
            return;
        }
        debug!("Waiting for executor workers to finish");
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Executor worker panicked");
            }
        }
        info!("Executor shutdown complete");
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("io_threads", &self.workers.len())
            .field("queue_capacity", &self.queue_capacity)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, rx: &Receiver<Job>, stats: &ExecutorStats) {
    debug!(worker_id, "Executor worker started");
    // Exits once every sender is gone and the queue is drained.
    for job in rx {
        job();
        stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }
    debug!(worker_id, "Executor worker exiting");
}
