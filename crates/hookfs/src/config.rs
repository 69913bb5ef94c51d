//! Configuration for a hooked filesystem.

use std::fmt;

use crate::error::HookFsError;

/// Display name reported for the filesystem when none is configured.
pub const DEFAULT_FS_NAME: &str = "hookfs";

/// Verbosity of the filesystem's logging.
///
/// Mirrors the numeric `--log-level` flag: `0` logs lifecycle events, `1`
/// adds every hook decision, `2` adds protocol-level tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
    Max,
}

impl LogLevel {
    /// Default `tracing_subscriber::EnvFilter` directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Max => "trace,fuser=trace",
        }
    }

    /// Whether the backing store should run in debug mode.
    pub fn is_debug(self) -> bool {
        self >= LogLevel::Debug
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = HookFsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LogLevel::Info),
            1 => Ok(LogLevel::Debug),
            2 => Ok(LogLevel::Max),
            other => Err(HookFsError::InvalidLogLevel(other)),
        }
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Info => 0,
            LogLevel::Debug => 1,
            LogLevel::Max => 2,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Configuration options for [`HookFs`](crate::HookFs).
#[derive(Debug, Clone)]
pub struct HookFsConfig {
    pub log_level: LogLevel,

    /// Display name reported by the filesystem. Default: `"hookfs"`.
    pub fs_name: String,
}

impl Default for HookFsConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            fs_name: DEFAULT_FS_NAME.to_string(),
        }
    }
}

impl HookFsConfig {
    #[must_use]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn fs_name(mut self, name: impl Into<String>) -> Self {
        self.fs_name = name.into();
        self
    }
}
