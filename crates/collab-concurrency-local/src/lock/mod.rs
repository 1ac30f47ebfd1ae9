mod memory;

pub use collab_concurrency_core::{LockGuard, LockManager, LockRequest, LockType, ResourceLock};
pub use memory::MemoryLockManager;
