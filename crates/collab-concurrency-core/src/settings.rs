use std::time::Duration;

/// Tunables for lock lifetime, conflict detection and background maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencySettings {
    /// How long a write lock taken by `execute` lives before it can be swept.
    pub lock_timeout: Duration,
    /// Maximum timestamp distance for two operations to be compared.
    pub conflict_window: Duration,
    /// Period of the background sweep.
    pub cleanup_interval: Duration,
    /// How long operations stay in the log as conflict evidence.
    pub operation_retention: Duration,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            conflict_window: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            operation_retention: Duration::from_secs(10 * 60),
        }
    }
}
