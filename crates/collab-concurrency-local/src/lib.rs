//! In-process concurrency control for collaborative tables.
//!
//! - `MemoryLockManager`: resource lock table with lazy and swept expiry
//! - `MemoryOperationLog`: per-resource operation history
//! - `ConcurrencyControlService`: lock -> detect/resolve -> apply -> release
//! - `MemoryRecordStore`: an in-memory record applier for replays and tests

pub mod lock;
pub mod oplog;
pub mod service;
pub mod store;

pub use lock::MemoryLockManager;
pub use oplog::MemoryOperationLog;
pub use service::{CleanupReport, ConcurrencyControlService, ConcurrencyStats};
pub use store::{MemoryRecordStore, RecordStoreError};
