//! Core traits and types for collaborative-table concurrency control.
//!
//! This crate defines the abstractions shared by every concurrency-control backend:
//! - `LockManager`: Resource-scoped locks with read/write/exclusive compatibility
//! - `OperationLog`: Time-bounded, per-resource history used as conflict evidence
//! - `ConflictDetector`: Windowed conflict detection and resolution proposals
//! - `OperationApplier`: The caller's domain mutation, run under lock

mod conflict;
mod error;
mod lock;
mod operation;
mod settings;

pub use conflict::{
    merge_data, select_winner, Conflict, ConflictDetector, ConflictResult, ConflictType,
    DeleteAction, Resolution, WindowedConflictDetector,
};
pub use error::{ConcurrencyError, ConflictRejection};
pub use lock::{LockGuard, LockManager, LockRequest, LockType, ResourceLock};
pub use operation::{
    resource_key, FieldData, Operation, OperationApplier, OperationLog, OperationType,
};
pub use settings::ConcurrencySettings;
