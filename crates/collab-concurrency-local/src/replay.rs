use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use collab_concurrency_core::{FieldData, Operation};
use collab_concurrency_local::{ConcurrencyControlService, ConcurrencyStats, MemoryRecordStore};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ReplayMode;

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub outcomes: Vec<OperationOutcome>,
    pub records: BTreeMap<String, FieldData>,
    pub stats: ConcurrencyStats,
}

#[derive(Debug, Serialize)]
pub struct OperationOutcome {
    pub operation_id: String,
    pub resource: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Applied,
    Rejected { error: String },
}

/// Read a JSON array of operations.
pub async fn load_operations(path: &Path) -> anyhow::Result<Vec<Operation>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse operations from {}", path.display()))
}

/// Push every operation through `service`, applying accepted ones to `store`.
pub async fn replay(
    service: &ConcurrencyControlService,
    store: &MemoryRecordStore,
    operations: Vec<Operation>,
    mode: ReplayMode,
) -> ReplayReport {
    info!("Replaying {} operations ({})", operations.len(), mode);

    let outcomes = match mode {
        ReplayMode::Concurrent => {
            join_all(
                operations
                    .into_iter()
                    .map(|operation| run_one(service, store, operation)),
            )
            .await
        }
        ReplayMode::Sequential => {
            let mut outcomes = Vec::with_capacity(operations.len());
            for operation in operations {
                outcomes.push(run_one(service, store, operation).await);
            }
            outcomes
        }
    };

    ReplayReport {
        outcomes,
        records: store.snapshot(),
        stats: service.stats(),
    }
}

async fn run_one(
    service: &ConcurrencyControlService,
    store: &MemoryRecordStore,
    operation: Operation,
) -> OperationOutcome {
    let operation_id = operation.id.clone();
    let resource = operation.resource_key();

    let status = match service.execute_with(operation, store).await {
        Ok(()) => OutcomeStatus::Applied,
        Err(e) => {
            warn!("Operation {} on {} rejected: {}", operation_id, resource, e);
            OutcomeStatus::Rejected {
                error: e.to_string(),
            }
        }
    };

    OperationOutcome {
        operation_id,
        resource,
        status,
    }
}
