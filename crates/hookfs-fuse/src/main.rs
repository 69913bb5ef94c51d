//! hookfs - Mount a directory through a fault-injecting FUSE filesystem.
//!
//! Usage: hookfs [--log-level N] MOUNTPOINT ORIGINAL
//!
//! The mount serves ORIGINAL with the random fault hook installed. Ctrl+C
//! or SIGTERM unmounts it.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;
use hookfs::{HookFs, HookFsConfig, LogLevel, RandomFaultHook};
use hookfs_fuse::MountConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hookfs")]
#[command(about = "Mount a directory through a fault-injecting FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Where to mount the hooked filesystem
    mountpoint: PathBuf,

    /// Directory to serve through the hooks
    original: PathBuf,

    /// Log verbosity: 0 = info, 1 = debug, 2 = trace (including FUSE protocol)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    log_level: u8,

    /// Allow users other than the mounting user to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Worker threads for hooked operations (0 = one per CPU)
    #[arg(long, env = "HOOKFS_IO_THREADS")]
    io_threads: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = LogLevel::try_from(cli.log_level)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.directive())),
        )
        .init();

    let original = cli
        .original
        .canonicalize()
        .with_context(|| format!("Original directory does not exist: {}", cli.original.display()))?;
    if !cli.mountpoint.is_dir() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mountpoint.display());
    }

    let hook = Arc::new(RandomFaultHook::new());
    let fs = HookFs::new(
        &original,
        &cli.mountpoint,
        Some(hook),
        HookFsConfig::default().log_level(level),
    )
    .context("Failed to initialize filesystem")?;
    info!(%fs, "Serving");

    let mut config = MountConfig::default().allow_other(cli.allow_other);
    config = match cli.io_threads {
        Some(0) => config.io_threads_per_cpu(),
        Some(n) => config.io_threads(n),
        None => config,
    };

    mount_and_wait(fs, config, &cli.mountpoint)
}

/// Mounts the filesystem and waits for Ctrl+C.
fn mount_and_wait(fs: HookFs, config: MountConfig, mountpoint: &std::path::Path) -> Result<()> {
    let (tx, rx) = mpsc::channel::<()>();

    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    let handle = hookfs_fuse::mount(fs, config).map_err(|e| {
        error!(error = %e, "Mount failed");
        anyhow::anyhow!("Failed to mount filesystem: {e}")
    })?;

    info!(mountpoint = %mountpoint.display(), "Filesystem mounted (press Ctrl+C to unmount)");
    info!(
        "If this process dies without unmounting, run `fusermount -u {}`",
        mountpoint.display()
    );

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    handle.unmount();
    info!("Filesystem unmounted");
    Ok(())
}
