//! Windowed conflict detection between operations on the same resource.
//!
//! Two operations are compared only when they touch the same resource, come
//! from different user/session pairs, are close enough in time and modify at
//! least one common field. The first such pair found is classified and paired
//! with a proposed resolution:
//!
//! | conflict            | strategy         | payload                  |
//! |---------------------|------------------|--------------------------|
//! | `delete_conflict`   | `delete_wins`    | `action = confirm_delete` |
//! | `concurrent_update` | `merge`          | merged data, winner      |
//! | `duplicate_create`  | `latest_wins`    | winner                   |
//! | `unknown_conflict`  | `manual_resolve` | none                     |

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::operation::{FieldData, Operation, OperationType};

/// Classification of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ConcurrentUpdate,
    DeleteConflict,
    DuplicateCreate,
    UnknownConflict,
}

impl ConflictType {
    /// Classify a conflicting pair. Delete takes priority over everything.
    pub fn classify(a: &Operation, b: &Operation) -> Self {
        use OperationType::*;
        match (a.operation_type, b.operation_type) {
            (Delete, _) | (_, Delete) => ConflictType::DeleteConflict,
            (Update, Update) => ConflictType::ConcurrentUpdate,
            (Create, Create) => ConflictType::DuplicateCreate,
            _ => ConflictType::UnknownConflict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteAction {
    ConfirmDelete,
}

/// Proposed handling of a conflict, tagged by strategy name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Resolution {
    Merge { merged_data: FieldData, winner: String },
    DeleteWins { action: DeleteAction },
    LatestWins { winner: String },
    ManualResolve,
    /// A strategy tag this build does not know how to apply.
    #[serde(other)]
    Unrecognized,
}

impl Resolution {
    pub fn strategy(&self) -> &'static str {
        match self {
            Resolution::Merge { .. } => "merge",
            Resolution::DeleteWins { .. } => "delete_wins",
            Resolution::LatestWins { .. } => "latest_wins",
            Resolution::ManualResolve => "manual_resolve",
            Resolution::Unrecognized => "unrecognized",
        }
    }
}

/// A detected conflict against an already-logged operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_type: ConflictType,
    /// The older operation the new one collides with
    pub conflicting_operation: Operation,
    pub resolution: Resolution,
}

/// Outcome of conflict detection, computed fresh per call.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResult {
    NoConflict,
    Conflict(Conflict),
}

impl ConflictResult {
    pub fn has_conflict(&self) -> bool {
        matches!(self, ConflictResult::Conflict(_))
    }

    pub fn into_conflict(self) -> Option<Conflict> {
        match self {
            ConflictResult::Conflict(conflict) => Some(conflict),
            ConflictResult::NoConflict => None,
        }
    }
}

/// Decides whether a new operation conflicts with logged ones.
pub trait ConflictDetector: Send + Sync {
    /// Compare `operation` against `existing` and report the first conflict.
    fn detect(&self, operation: &Operation, existing: &[Operation]) -> ConflictResult;
}

/// Default detector: time-windowed, field-overlap based.
#[derive(Debug, Clone)]
pub struct WindowedConflictDetector {
    window: TimeDelta,
}

impl WindowedConflictDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Whether the pair is close enough, from different actors, on the same
    /// resource, and touching a shared field.
    fn conflicts_with(&self, operation: &Operation, existing: &Operation) -> bool {
        if !operation.same_resource(existing) || operation.same_actor(existing) {
            return false;
        }

        if (operation.timestamp - existing.timestamp).abs() > self.window {
            return false;
        }

        operation.data.keys().any(|key| existing.data.contains_key(key))
    }

    fn resolve(
        operation: &Operation,
        existing: &Operation,
        conflict_type: ConflictType,
    ) -> Resolution {
        match conflict_type {
            ConflictType::ConcurrentUpdate => {
                let (older, newer) = if existing.timestamp > operation.timestamp {
                    (operation, existing)
                } else {
                    (existing, operation)
                };
                Resolution::Merge {
                    merged_data: merge_data(&older.data, &newer.data),
                    winner: select_winner(operation, existing).id.clone(),
                }
            }
            ConflictType::DeleteConflict => Resolution::DeleteWins {
                action: DeleteAction::ConfirmDelete,
            },
            ConflictType::DuplicateCreate => Resolution::LatestWins {
                winner: select_winner(operation, existing).id.clone(),
            },
            ConflictType::UnknownConflict => Resolution::ManualResolve,
        }
    }
}

impl Default for WindowedConflictDetector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ConflictDetector for WindowedConflictDetector {
    fn detect(&self, operation: &Operation, existing: &[Operation]) -> ConflictResult {
        let Some(conflicting) = existing
            .iter()
            .find(|existing| self.conflicts_with(operation, existing))
        else {
            return ConflictResult::NoConflict;
        };

        let conflict_type = ConflictType::classify(operation, conflicting);
        let resolution = Self::resolve(operation, conflicting, conflict_type);
        debug!(
            "Operation {} conflicts with {} on {} ({:?}, strategy {})",
            operation.id,
            conflicting.id,
            operation.resource_key(),
            conflict_type,
            resolution.strategy()
        );

        ConflictResult::Conflict(Conflict {
            conflict_type,
            conflicting_operation: conflicting.clone(),
            resolution,
        })
    }
}

/// Shallow union of two field maps; `newer` wins on overlapping keys.
pub fn merge_data(older: &FieldData, newer: &FieldData) -> FieldData {
    let mut merged = older.clone();
    for (key, value) in newer {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Higher version wins, then later timestamp. A full tie goes to `b`.
pub fn select_winner<'a>(a: &'a Operation, b: &'a Operation) -> &'a Operation {
    if a.version != b.version {
        return if a.version > b.version { a } else { b };
    }
    if a.timestamp > b.timestamp {
        a
    } else {
        b
    }
}
