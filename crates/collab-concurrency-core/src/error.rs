use thiserror::Error;

/// Errors returned by the concurrency-control layer.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    #[error("resource {resource_key} is locked by user {holder}")]
    LockUnavailable { resource_key: String, holder: String },

    /// `reason` is `"not_owner"` when someone else holds the lock and
    /// `"not_found"` when there is no live lock at all.
    #[error("lock on {resource_key} not owned by user {owner_id} session {session_id} ({reason})")]
    LockNotOwned {
        resource_key: String,
        owner_id: String,
        session_id: String,
        reason: &'static str,
    },

    #[error(transparent)]
    ConflictRejected(#[from] ConflictRejection),

    /// The caller's apply step failed; its error is passed through untouched.
    #[error(transparent)]
    ExecutorFailure(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Policy outcomes that abort an operation after a conflict was detected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictRejection {
    #[error("operation cancelled due to delete conflict")]
    DeleteConflict,

    #[error("operation cancelled, latest operation wins")]
    LatestWins { winner: String },

    #[error("manual conflict resolution required")]
    ManualResolve,
}
