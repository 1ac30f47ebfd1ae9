use std::time::Duration;

use chrono::{TimeDelta, Utc};
use collab_concurrency_core::{resource_key, Operation, OperationLog};
use dashmap::DashMap;
use tracing::{debug, instrument};

/// In-process operation log: `{resource_type}:{resource_id}` -> operations,
/// oldest first.
#[derive(Debug, Default)]
pub struct MemoryOperationLog {
    operations: DashMap<String, Vec<Operation>>,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OperationLog for MemoryOperationLog {
    fn add(&self, operation: Operation) {
        self.operations
            .entry(operation.resource_key())
            .or_default()
            .push(operation);
    }

    fn operations(&self, resource_type: &str, resource_id: &str) -> Vec<Operation> {
        self.operations
            .get(&resource_key(resource_type, resource_id))
            .map(|ops| ops.to_vec())
            .unwrap_or_default()
    }

    #[instrument(skip(self), level = "debug")]
    fn remove(&self, resource_type: &str, resource_id: &str, operation_id: &str) {
        let key = resource_key(resource_type, resource_id);

        let emptied = match self.operations.get_mut(&key) {
            Some(mut ops) => {
                if let Some(pos) = ops.iter().position(|op| op.id == operation_id) {
                    ops.remove(pos);
                    debug!("Removed operation {} from {}", operation_id, key);
                }
                ops.is_empty()
            }
            None => false,
        };

        if emptied {
            self.operations.remove_if(&key, |_, ops| ops.is_empty());
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut removed = 0;
        self.operations.retain(|key, ops| {
            let before = ops.len();
            ops.retain(|op| op.timestamp >= cutoff);
            if ops.len() < before {
                debug!("Dropped {} aged operations from {}", before - ops.len(), key);
                removed += before - ops.len();
            }
            !ops.is_empty()
        });
        removed
    }

    fn len(&self) -> usize {
        self.operations.iter().map(|entry| entry.value().len()).sum()
    }

    fn resource_count(&self) -> usize {
        self.operations.len()
    }
}
