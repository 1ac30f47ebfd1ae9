use std::collections::BTreeMap;

use async_trait::async_trait;
use collab_concurrency_core::{FieldData, Operation, OperationApplier, OperationType};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum RecordStoreError {
    #[error("record {0} already exists")]
    AlreadyExists(String),

    #[error("record {0} not found")]
    NotFound(String),
}

/// Records held in memory, keyed by resource key.
///
/// Create inserts, update shallow-merges fields, delete removes.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<String, FieldData>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource_key: &str) -> Option<FieldData> {
        self.records.get(resource_key).map(|record| record.value().clone())
    }

    /// All records, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, FieldData> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl OperationApplier for MemoryRecordStore {
    #[instrument(skip(self, operation), fields(operation_id = %operation.id), level = "debug")]
    async fn apply(&self, operation: &Operation) -> anyhow::Result<()> {
        let key = operation.resource_key();

        match operation.operation_type {
            OperationType::Create => match self.records.entry(key) {
                Entry::Occupied(entry) => {
                    return Err(RecordStoreError::AlreadyExists(entry.key().clone()).into());
                }
                Entry::Vacant(entry) => {
                    debug!("Created record {}", entry.key());
                    entry.insert(operation.data.clone());
                }
            },
            OperationType::Update => {
                let mut record = self
                    .records
                    .get_mut(&key)
                    .ok_or_else(|| RecordStoreError::NotFound(key.clone()))?;
                for (field, value) in &operation.data {
                    record.insert(field.clone(), value.clone());
                }
                debug!("Updated {} fields on record {}", operation.data.len(), key);
            }
            OperationType::Delete => {
                self.records
                    .remove(&key)
                    .ok_or_else(|| RecordStoreError::NotFound(key.clone()))?;
                debug!("Deleted record {}", key);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(kind: OperationType) -> Operation {
        Operation::new(kind, "record", "rec1", "user1", "s1")
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let store = MemoryRecordStore::new();

        store
            .apply(&op(OperationType::Create).with_field("name", json!("a")))
            .await
            .unwrap();
        store
            .apply(&op(OperationType::Update).with_field("status", json!("done")))
            .await
            .unwrap();

        let record = store.get("record:rec1").unwrap();
        assert_eq!(record.get("name"), Some(&json!("a")));
        assert_eq!(record.get("status"), Some(&json!("done")));

        store.apply(&op(OperationType::Delete)).await.unwrap();
        assert!(store.get("record:rec1").is_none());
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let store = MemoryRecordStore::new();

        let err = store.apply(&op(OperationType::Update)).await.unwrap_err();
        assert_eq!(err.to_string(), "record record:rec1 not found");
        assert!(store.apply(&op(OperationType::Delete)).await.is_err());

        store.apply(&op(OperationType::Create)).await.unwrap();
        let err = store.apply(&op(OperationType::Create)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecordStoreError>(),
            Some(RecordStoreError::AlreadyExists(_))
        ));
    }
}
