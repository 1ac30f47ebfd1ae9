use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use collab_concurrency_core::{
    ConcurrencyError, ConcurrencySettings, ConflictDetector, ConflictRejection, ConflictResult,
    LockGuard, LockManager, LockRequest, Operation, OperationApplier, OperationLog,
    OperationType, Resolution, ResourceLock, WindowedConflictDetector,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::lock::MemoryLockManager;
use crate::oplog::MemoryOperationLog;

/// Snapshot of the lock table and log for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyStats {
    pub backend: &'static str,
    pub active_locks: usize,
    pub lock_details: HashMap<String, ResourceLock>,
    pub tracked_resources: usize,
    pub logged_operations: usize,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_locks: usize,
    pub expired_operations: usize,
}

/// Public entry point for running mutations under concurrency control.
///
/// Sequences lock acquisition, conflict detection and resolution, the
/// caller's apply step and log bookkeeping. The write lock is held only for
/// the duration of one `execute` call and released on every exit path.
pub struct ConcurrencyControlService {
    lock_manager: Box<dyn LockManager>,
    operation_log: Box<dyn OperationLog>,
    conflict_detector: Box<dyn ConflictDetector>,
    settings: ConcurrencySettings,
}

impl ConcurrencyControlService {
    pub fn new(
        lock_manager: Box<dyn LockManager>,
        operation_log: Box<dyn OperationLog>,
        conflict_detector: Box<dyn ConflictDetector>,
        settings: ConcurrencySettings,
    ) -> Self {
        Self {
            lock_manager,
            operation_log,
            conflict_detector,
            settings,
        }
    }

    /// In-process lock table, log and the windowed detector.
    pub fn in_memory(settings: ConcurrencySettings) -> Self {
        Self::new(
            Box::new(MemoryLockManager::new()),
            Box::new(MemoryOperationLog::new()),
            Box::new(WindowedConflictDetector::new(settings.conflict_window)),
            settings,
        )
    }

    pub fn lock_manager(&self) -> &dyn LockManager {
        self.lock_manager.as_ref()
    }

    pub fn operation_log(&self) -> &dyn OperationLog {
        self.operation_log.as_ref()
    }

    /// Run `apply` for `operation` under a write lock on its resource.
    ///
    /// On a `merge` resolution the operation's data is replaced by the merged
    /// payload before `apply` sees it. If `apply` fails the operation is
    /// taken back out of the log and its error is returned unchanged inside
    /// `ConcurrencyError::ExecutorFailure`. Dropping the returned future
    /// mid-apply also takes the operation back out and releases the lock.
    #[instrument(
        skip(self, operation, apply),
        fields(operation_id = %operation.id, resource = %operation.resource_key()),
        level = "debug"
    )]
    pub async fn execute<F, Fut>(
        &self,
        mut operation: Operation,
        apply: F,
    ) -> Result<(), ConcurrencyError>
    where
        F: FnOnce(Operation) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let request = LockRequest::write_for(&operation, self.settings.lock_timeout);
        let guard = LockGuard::acquire(self.lock_manager.as_ref(), &request)?;
        debug!("Write lock held until {}", guard.lock().expires_at);

        let existing = self
            .operation_log
            .operations(&operation.resource_type, &operation.resource_id);
        if let ConflictResult::Conflict(conflict) =
            self.conflict_detector.detect(&operation, &existing)
        {
            warn!(
                operation_id = %operation.id,
                conflict_type = ?conflict.conflict_type,
                conflicting_op_id = %conflict.conflicting_operation.id,
                "Operation conflict detected"
            );
            Self::apply_resolution(&mut operation, conflict.resolution)?;
        }

        self.operation_log.add(operation.clone());
        let rollback = LogRollback::new(self.operation_log.as_ref(), &operation);

        if let Err(err) = apply(operation.clone()).await {
            drop(rollback);
            warn!(
                operation_id = %operation.id,
                "Operation failed and was removed from the log: {}",
                err
            );
            return Err(ConcurrencyError::ExecutorFailure(err));
        }
        rollback.disarm();

        info!(
            operation_id = %operation.id,
            resource_type = %operation.resource_type,
            resource_id = %operation.resource_id,
            user_id = %operation.user_id,
            "Operation executed successfully"
        );
        Ok(())
    }

    /// `execute` driven by a strategy object instead of a closure.
    pub async fn execute_with(
        &self,
        operation: Operation,
        applier: &dyn OperationApplier,
    ) -> Result<(), ConcurrencyError> {
        self.execute(operation, |operation| async move {
            applier.apply(&operation).await
        })
        .await
    }

    /// Decide whether a conflicted operation may proceed, rewriting its data
    /// for merges.
    fn apply_resolution(
        operation: &mut Operation,
        resolution: Resolution,
    ) -> Result<(), ConcurrencyError> {
        match resolution {
            Resolution::Merge { merged_data, .. } => {
                debug!("Merging data into operation {}", operation.id);
                operation.data = merged_data;
                Ok(())
            }
            Resolution::DeleteWins { .. } => {
                if operation.operation_type == OperationType::Delete {
                    Ok(())
                } else {
                    Err(ConflictRejection::DeleteConflict.into())
                }
            }
            Resolution::LatestWins { winner } => {
                if winner == operation.id {
                    Ok(())
                } else {
                    Err(ConflictRejection::LatestWins { winner }.into())
                }
            }
            Resolution::ManualResolve => Err(ConflictRejection::ManualResolve.into()),
            Resolution::Unrecognized => Err(ConcurrencyError::Internal(
                "unknown conflict resolution strategy".to_string(),
            )),
        }
    }

    /// One maintenance pass: expire stale locks and age out old operations.
    pub fn run_cleanup(&self) -> CleanupReport {
        let report = CleanupReport {
            expired_locks: self.lock_manager.cleanup_expired(),
            expired_operations: self
                .operation_log
                .cleanup_older_than(self.settings.operation_retention),
        };
        if report != CleanupReport::default() {
            info!(
                "Cleanup removed {} expired locks and {} aged operations",
                report.expired_locks, report.expired_operations
            );
        }
        report
    }

    /// Spawn the periodic sweep. It stops once `shutdown` turns true or its
    /// sender is dropped.
    pub fn start_cleanup_task(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = self.settings.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Cleanup task started (every {:?})", period);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_cleanup();
                    }
                }
            }

            info!("Cleanup task stopped");
        })
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let lock_details = self.lock_manager.active_locks();
        ConcurrencyStats {
            backend: self.lock_manager.backend_name(),
            active_locks: lock_details.len(),
            lock_details,
            tracked_resources: self.operation_log.resource_count(),
            logged_operations: self.operation_log.len(),
        }
    }
}

/// Takes a logged operation back out of the log when dropped while armed.
///
/// Covers apply failures and callers dropping the `execute` future mid-apply.
struct LogRollback<'a> {
    log: &'a dyn OperationLog,
    operation: &'a Operation,
    armed: bool,
}

impl<'a> LogRollback<'a> {
    fn new(log: &'a dyn OperationLog, operation: &'a Operation) -> Self {
        Self {
            log,
            operation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LogRollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            let op = self.operation;
            self.log.remove(&op.resource_type, &op.resource_id, &op.id);
            debug!("Rolled operation {} out of the log", op.id);
        }
    }
}

impl Default for ConcurrencyControlService {
    fn default() -> Self {
        Self::in_memory(ConcurrencySettings::default())
    }
}
