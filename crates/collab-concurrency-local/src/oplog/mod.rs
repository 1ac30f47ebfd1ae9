mod memory;

pub use collab_concurrency_core::OperationLog;
pub use memory::MemoryOperationLog;
