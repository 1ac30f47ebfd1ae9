use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Changed field name -> new value.
pub type FieldData = serde_json::Map<String, serde_json::Value>;

/// Join key for locks and operation logs: `"{resource_type}:{resource_id}"`.
///
/// The key is not escaped, so a `:` inside `resource_type` can alias another
/// pair: `("a:b", "c")` and `("a", "b:c")` share a lock slot and a log entry.
/// Resource types are expected to be plain identifiers like `record`.
pub fn resource_key(resource_type: &str, resource_id: &str) -> String {
    format!("{}:{}", resource_type, resource_id)
}

/// Kind of mutation an operation proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

/// A proposed mutation of a record, table, field or view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default = "new_operation_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub resource_type: String,
    pub resource_id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub data: FieldData,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Monotonic counter supplied by the caller
    #[serde(default)]
    pub version: i64,
}

fn new_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Operation {
    /// Create an operation with a fresh id, empty data, version 0 and the
    /// current time.
    pub fn new(
        operation_type: OperationType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_operation_id(),
            operation_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            data: FieldData::new(),
            timestamp: Utc::now(),
            version: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(name.into(), value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn resource_key(&self) -> String {
        resource_key(&self.resource_type, &self.resource_id)
    }

    /// Whether both operations come from the same user in the same session.
    pub fn same_actor(&self, other: &Operation) -> bool {
        self.user_id == other.user_id && self.session_id == other.session_id
    }

    pub fn same_resource(&self, other: &Operation) -> bool {
        self.resource_type == other.resource_type && self.resource_id == other.resource_id
    }
}

/// Per-resource history of recently executed operations.
///
/// The log is conflict evidence only, not an audit trail. Reads always
/// return copies so callers never observe concurrent appends or removals.
pub trait OperationLog: Send + Sync {
    /// Append to the sequence for the operation's resource key.
    fn add(&self, operation: Operation);

    /// Copy of the sequence for a resource, oldest first.
    fn operations(&self, resource_type: &str, resource_id: &str) -> Vec<Operation>;

    /// Remove the first entry with `operation_id`. No-op if absent.
    fn remove(&self, resource_type: &str, resource_id: &str, operation_id: &str);

    /// Drop entries with `timestamp < now - max_age`, pruning empty keys.
    /// Returns how many entries were dropped.
    fn cleanup_older_than(&self, max_age: Duration) -> usize;

    /// Total number of retained operations.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of resource keys with at least one retained operation.
    fn resource_count(&self) -> usize;
}

/// The caller's domain mutation (e.g. persisting a record change).
///
/// Invoked at most once per execution, under lock, after conflict
/// resolution. A failure rolls the operation out of the log but nothing
/// here undoes side effects the applier already performed.
#[async_trait]
pub trait OperationApplier: Send + Sync {
    async fn apply(&self, operation: &Operation) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_key_format() {
        assert_eq!(resource_key("record", "rec1"), "record:rec1");
    }

    #[test]
    fn test_resource_key_is_not_escaped() {
        assert_eq!(resource_key("a:b", "c"), resource_key("a", "b:c"));
        assert_eq!(resource_key("record", "x:y"), "record:x:y");
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let op: Operation = serde_json::from_value(json!({
            "type": "update",
            "resource_type": "record",
            "resource_id": "rec1",
            "user_id": "user1",
            "session_id": "s1",
            "data": {"status": "done"}
        }))
        .unwrap();

        assert_eq!(op.operation_type, OperationType::Update);
        assert!(!op.id.is_empty());
        assert_eq!(op.version, 0);
        assert_eq!(op.data.get("status"), Some(&json!("done")));
    }

    #[test]
    fn test_same_actor_requires_both_ids() {
        let a = Operation::new(OperationType::Update, "record", "rec1", "user1", "s1");
        let b = Operation::new(OperationType::Update, "record", "rec1", "user1", "s2");
        assert!(a.same_actor(&a.clone()));
        assert!(!a.same_actor(&b));
        assert!(a.same_resource(&b));
    }
}
