use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::bail;
use clap::Parser;
use collab_concurrency_core::ConcurrencySettings;

/// Configuration for the collab-concurrency-local replay tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "collab-concurrency-local")]
#[command(about = "Replay collaborative-table operations through in-process concurrency control")]
pub struct Config {
    /// JSON file holding an array of operations
    #[arg(long, env = "REPLAY_OPERATIONS_FILE")]
    pub operations: PathBuf,

    /// Replay mode: sequential (file order) or concurrent (all at once)
    #[arg(long, default_value = "sequential", env = "REPLAY_MODE")]
    pub mode: ReplayMode,

    /// How long an acquired lock stays valid
    #[arg(long, default_value = "30", env = "CONCURRENCY_LOCK_TIMEOUT_SECS")]
    pub lock_timeout_secs: u64,

    /// Maximum timestamp distance for two operations to conflict
    #[arg(long, default_value = "5", env = "CONCURRENCY_CONFLICT_WINDOW_SECS")]
    pub conflict_window_secs: u64,

    /// Period of the background sweep
    #[arg(long, default_value = "60", env = "CONCURRENCY_CLEANUP_INTERVAL_SECS")]
    pub cleanup_interval_secs: u64,

    /// Age after which logged operations are dropped by the sweep
    #[arg(long, default_value = "600", env = "CONCURRENCY_OPERATION_RETENTION_SECS")]
    pub operation_retention_secs: u64,
}

impl Config {
    /// Build validated concurrency settings.
    pub fn settings(&self) -> anyhow::Result<ConcurrencySettings> {
        if self.cleanup_interval_secs == 0 {
            bail!("--cleanup-interval-secs must be greater than zero");
        }
        if Instant::now()
            .checked_add(Duration::from_secs(self.cleanup_interval_secs))
            .is_none()
        {
            bail!("--cleanup-interval-secs is too large");
        }
        if self.lock_timeout_secs == 0 {
            bail!("--lock-timeout-secs must be greater than zero");
        }

        Ok(ConcurrencySettings {
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            conflict_window: Duration::from_secs(self.conflict_window_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            operation_retention: Duration::from_secs(self.operation_retention_secs),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReplayMode {
    Sequential,
    Concurrent,
}

impl std::fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayMode::Sequential => write!(f, "sequential"),
            ReplayMode::Concurrent => write!(f, "concurrent"),
        }
    }
}
