// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation registry and state machine.
//!
//! The registry is the canonical record of every operation's status. All
//! status changes go through [`OperationRegistry::transition`], which checks
//! the fixed edge table and applies the change as a compare-and-set on the
//! status observed a moment earlier. When two callers race (for example a
//! cancel and a completion), exactly one wins and the other re-reads the row
//! and gets the actual status back in its error.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoints::{CheckpointStore, validate_path_segment};
use crate::error::{CoreError, Result};
use crate::persistence::{
    ClaimUpdate, HeartbeatUpdate, ListOperationsFilter, NewOperationRow, OperationRecord,
    Persistence, StatusUpdate,
};
use crate::types::{CheckpointType, Document, OperationStatus, OperationType, ReconciliationStatus};

/// Metadata key holding linked child operation ids.
pub const CHILD_OPERATION_IDS_KEY: &str = "child_operation_ids";

/// Maximum length of a caller-supplied operation id.
pub const MAX_OPERATION_ID_LEN: usize = 128;

/// Largest page size accepted by [`OperationRegistry::list`].
pub const MAX_PAGE_SIZE: i64 = 500;

/// Compare-and-set attempts before giving up on a contended row.
const MAX_CAS_ATTEMPTS: usize = 5;

/// An operation as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub operation_type: String,
    pub status: OperationStatus,
    pub worker_id: Option<String>,
    pub is_backend_local: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_percent: f64,
    pub progress_message: Option<String>,
    pub metadata: Document,
    pub result: Option<Document>,
    pub error_message: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub reconciliation_status: Option<ReconciliationStatus>,
    pub reconciliation_started_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Linked children, oldest first.
    pub fn child_operation_ids(&self) -> Vec<String> {
        child_ids(self.metadata.get(CHILD_OPERATION_IDS_KEY))
    }
}

fn child_ids(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn decode_error(details: impl ToString) -> CoreError {
    CoreError::DatabaseError {
        operation: "decode_operation".to_string(),
        details: details.to_string(),
    }
}

impl TryFrom<OperationRecord> for Operation {
    type Error = CoreError;

    fn try_from(record: OperationRecord) -> Result<Self> {
        let status: OperationStatus = record.status.parse().map_err(decode_error)?;
        let reconciliation_status = record
            .reconciliation_status
            .as_deref()
            .map(str::parse::<ReconciliationStatus>)
            .transpose()
            .map_err(decode_error)?;
        let metadata = Document::from_value(record.metadata.0).map_err(decode_error)?;
        let result = record
            .result
            .map(|json| Document::from_value(json.0))
            .transpose()
            .map_err(decode_error)?;

        Ok(Self {
            operation_id: record.operation_id,
            operation_type: record.operation_type,
            status,
            worker_id: record.worker_id,
            is_backend_local: record.is_backend_local,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            progress_percent: record.progress_percent,
            progress_message: record.progress_message,
            metadata,
            result,
            error_message: record.error_message,
            last_heartbeat_at: record.last_heartbeat_at,
            reconciliation_status,
            reconciliation_started_at: record.reconciliation_started_at,
        })
    }
}

/// Parameters for creating an operation.
#[derive(Debug, Clone)]
pub struct NewOperation {
    /// Caller-supplied id; generated as `op_<uuid>` when absent.
    pub operation_id: Option<String>,
    pub operation_type: OperationType,
    pub metadata: Document,
    pub is_backend_local: bool,
}

impl NewOperation {
    /// A remote operation with a generated id.
    pub fn new(operation_type: OperationType, metadata: Document) -> Self {
        Self {
            operation_id: None,
            operation_type,
            metadata,
            is_backend_local: false,
        }
    }

    /// Use a caller-supplied id.
    pub fn with_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    /// Mark the operation as executed by the backend itself.
    pub fn backend_local(mut self) -> Self {
        self.is_backend_local = true;
        self
    }
}

/// List filter and pagination.
#[derive(Debug, Clone)]
pub struct OperationFilter {
    pub operation_type: Option<String>,
    pub status: Option<OperationStatus>,
    pub active_only: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for OperationFilter {
    fn default() -> Self {
        Self {
            operation_type: None,
            status: None,
            active_only: false,
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of operations, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPage {
    pub operations: Vec<Operation>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// A requested status change.
#[derive(Debug, Clone)]
pub struct Transition {
    pub to: OperationStatus,
    /// Owner to record when entering `running`.
    pub worker_id: Option<String>,
    /// Owner the caller claims to be; checked before the change.
    pub expected_worker: Option<String>,
    pub result: Option<Document>,
    pub error_message: Option<String>,
    /// When the work actually finished, if it ended before it was reported.
    /// Clamped to now.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transition {
    /// Change to `status` with no payload.
    pub fn to(status: OperationStatus) -> Self {
        Self {
            to: status,
            worker_id: None,
            expected_worker: None,
            result: None,
            error_message: None,
            completed_at: None,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn expecting_worker(mut self, worker_id: Option<String>) -> Self {
        self.expected_worker = worker_id;
        self
    }

    pub fn with_result(mut self, result: Option<Document>) -> Self {
        self.result = result;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = at;
        self
    }
}

/// Progress reported with a heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    /// Percentage; clamped to 0..=100, non-finite values ignored.
    pub percent: Option<f64>,
    pub message: Option<String>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
    pub operation_id: String,
    /// Most recently linked child, if any.
    pub child_operation_id: Option<String>,
    /// Children cancelled by the cascade.
    #[serde(default)]
    pub cancelled_children: Vec<String>,
}

/// Canonical store of operation status.
#[derive(Clone)]
pub struct OperationRegistry {
    persistence: Arc<dyn Persistence>,
    checkpoints: CheckpointStore,
}

impl OperationRegistry {
    /// Create a registry. Completion and failure consult the checkpoint
    /// policies held by `checkpoints`.
    pub fn new(persistence: Arc<dyn Persistence>, checkpoints: CheckpointStore) -> Self {
        Self {
            persistence,
            checkpoints,
        }
    }

    /// The checkpoint store used for policy hooks.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Create a `pending` remote operation and return its generated id.
    pub async fn create(&self, operation_type: OperationType, metadata: Document) -> Result<String> {
        let op = self
            .create_with(NewOperation::new(operation_type, metadata))
            .await?;
        Ok(op.operation_id)
    }

    /// Create a `pending` operation.
    pub async fn create_with(&self, new: NewOperation) -> Result<Operation> {
        let operation_id = match new.operation_id {
            Some(id) => {
                validate_operation_id(&id)?;
                id
            }
            None => format!("op_{}", Uuid::new_v4().simple()),
        };

        let row = NewOperationRow {
            operation_id: operation_id.clone(),
            operation_type: new.operation_type.as_str().to_string(),
            is_backend_local: new.is_backend_local,
            metadata: new.metadata.into_value(),
            created_at: Utc::now(),
        };
        self.persistence.insert_operation(&row).await?;

        info!(
            operation_id = %operation_id,
            operation_type = %row.operation_type,
            is_backend_local = row.is_backend_local,
            "Operation created"
        );

        self.get(&operation_id).await
    }

    /// Fetch an operation, or `None`.
    pub async fn find(&self, operation_id: &str) -> Result<Option<Operation>> {
        self.persistence
            .get_operation(operation_id)
            .await?
            .map(Operation::try_from)
            .transpose()
    }

    /// Fetch an operation; missing is `OperationNotFound`.
    pub async fn get(&self, operation_id: &str) -> Result<Operation> {
        self.find(operation_id)
            .await?
            .ok_or_else(|| CoreError::OperationNotFound {
                operation_id: operation_id.to_string(),
            })
    }

    /// List operations, newest first.
    pub async fn list(&self, filter: &OperationFilter) -> Result<OperationPage> {
        let limit = filter.limit.clamp(1, MAX_PAGE_SIZE);
        let offset = filter.offset.max(0);
        let db_filter = ListOperationsFilter {
            operation_type: filter.operation_type.clone(),
            status: filter.status.map(|s| s.as_str().to_string()),
            active_only: filter.active_only,
            worker_id: None,
        };

        let records = self
            .persistence
            .list_operations(&db_filter, limit, offset)
            .await?;
        let total = self.persistence.count_operations(&db_filter).await?;
        let operations = records
            .into_iter()
            .map(Operation::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(OperationPage {
            operations,
            total,
            limit,
            offset,
        })
    }

    /// Active operations owned by `worker_id`.
    pub async fn active_for_worker(&self, worker_id: &str) -> Result<Vec<Operation>> {
        let filter = ListOperationsFilter {
            active_only: true,
            worker_id: Some(worker_id.to_string()),
            ..Default::default()
        };
        self.persistence
            .list_operations(&filter, MAX_PAGE_SIZE, 0)
            .await?
            .into_iter()
            .map(Operation::try_from)
            .collect()
    }

    /// Apply a status change if the edge table allows it.
    ///
    /// Illegal edges return `InvalidTransition` and leave the row untouched.
    pub async fn transition(&self, operation_id: &str, transition: Transition) -> Result<Operation> {
        let to = transition.to;
        let result_value = transition.result.as_ref().map(Document::to_value);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.get(operation_id).await?;

            if !current.status.can_transition_to(to) {
                debug!(
                    operation_id = %operation_id,
                    from = %current.status,
                    to = %to,
                    "Rejected illegal transition"
                );
                return Err(CoreError::InvalidTransition {
                    operation_id: operation_id.to_string(),
                    from: current.status.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }

            if let Some(expected) = transition.expected_worker.as_deref()
                && current.worker_id.as_deref() != Some(expected)
            {
                return Err(CoreError::OwnershipConflict {
                    operation_id: operation_id.to_string(),
                    owner: current.worker_id,
                    claimant: Some(expected.to_string()),
                });
            }

            let reconciliation_status = match (current.status, to) {
                (_, OperationStatus::PendingReconciliation) => Some(ReconciliationStatus::Unreconciled),
                (OperationStatus::PendingReconciliation, _) => Some(ReconciliationStatus::Reconciled),
                _ => None,
            };

            let now = Utc::now();
            let update = StatusUpdate {
                operation_id,
                expected_status: current.status.as_str(),
                new_status: to.as_str(),
                now,
                worker_id: transition.worker_id.as_deref(),
                result: result_value.as_ref(),
                error_message: transition.error_message.as_deref(),
                reconciliation_status: reconciliation_status.as_ref().map(|s| s.as_str()),
                expected_worker: transition.expected_worker.as_deref(),
                completed_at: transition.completed_at.map(|at| at.min(now)),
            };

            if self.persistence.update_status(&update).await? {
                info!(
                    operation_id = %operation_id,
                    from = %current.status,
                    to = %to,
                    worker_id = ?transition.worker_id.as_deref().or(current.worker_id.as_deref()),
                    "Operation transitioned"
                );
                return self.get(operation_id).await;
            }

            debug!(
                operation_id = %operation_id,
                expected = %current.status,
                attempt,
                "Status changed concurrently, re-reading"
            );
        }

        let current = self.get(operation_id).await?;
        Err(CoreError::InvalidOperationState {
            operation_id: operation_id.to_string(),
            expected: to.as_str().to_string(),
            actual: current.status.as_str().to_string(),
        })
    }

    /// `pending -> running`, recording the owner (none for backend-local work).
    pub async fn start(&self, operation_id: &str, worker_id: Option<&str>) -> Result<Operation> {
        let mut transition = Transition::to(OperationStatus::Running);
        transition.worker_id = worker_id.map(str::to_string);
        self.transition(operation_id, transition).await
    }

    /// Record a heartbeat and progress on a `running` operation.
    ///
    /// Rejected without mutation when the operation is not running
    /// (`InvalidOperationState`) or is owned by someone else
    /// (`OwnershipConflict`).
    pub async fn record_heartbeat(
        &self,
        operation_id: &str,
        worker_id: Option<&str>,
        progress: Progress,
    ) -> Result<Operation> {
        let percent = progress
            .percent
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0));

        let applied = self
            .persistence
            .record_heartbeat(&HeartbeatUpdate {
                operation_id,
                worker_id,
                progress_percent: percent,
                progress_message: progress.message.as_deref(),
                now: Utc::now(),
            })
            .await?;

        let current = self.get(operation_id).await?;
        if applied {
            return Ok(current);
        }

        if current.status != OperationStatus::Running {
            return Err(CoreError::InvalidOperationState {
                operation_id: operation_id.to_string(),
                expected: OperationStatus::Running.as_str().to_string(),
                actual: current.status.as_str().to_string(),
            });
        }

        warn!(
            operation_id = %operation_id,
            owner = ?current.worker_id,
            claimant = ?worker_id,
            "Heartbeat from non-owner rejected"
        );
        Err(CoreError::OwnershipConflict {
            operation_id: operation_id.to_string(),
            owner: current.worker_id,
            claimant: worker_id.map(str::to_string),
        })
    }

    /// Mark an operation completed.
    ///
    /// When the type's policy has `delete_on_completion`, the checkpoint is
    /// deleted afterwards.
    pub async fn complete(&self, operation_id: &str, result: Option<Document>) -> Result<Operation> {
        self.complete_as(operation_id, None, result).await
    }

    /// [`complete`](Self::complete), optionally asserting the owner.
    pub async fn complete_as(
        &self,
        operation_id: &str,
        worker_id: Option<&str>,
        result: Option<Document>,
    ) -> Result<Operation> {
        self.finish_completed(
            operation_id,
            Transition::to(OperationStatus::Completed)
                .expecting_worker(worker_id.map(str::to_string))
                .with_result(result),
        )
        .await
    }

    /// Apply a completion a worker reported after the fact, keeping its
    /// finish time.
    pub async fn complete_reported(
        &self,
        operation_id: &str,
        result: Option<Document>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Operation> {
        self.finish_completed(
            operation_id,
            Transition::to(OperationStatus::Completed)
                .with_result(result)
                .completed_at(completed_at),
        )
        .await
    }

    async fn finish_completed(&self, operation_id: &str, transition: Transition) -> Result<Operation> {
        let op = self.transition(operation_id, transition).await?;

        if self
            .checkpoints
            .policies()
            .for_type(&op.operation_type)
            .delete_on_completion
        {
            match self.checkpoints.delete_checkpoint(operation_id).await {
                Ok(true) => debug!(operation_id = %operation_id, "Deleted checkpoint on completion"),
                Ok(false) => {}
                Err(e) => warn!(
                    operation_id = %operation_id,
                    error = %e,
                    "Failed to delete checkpoint on completion"
                ),
            }
        }

        Ok(op)
    }

    /// Mark an operation failed.
    ///
    /// When `failure_state` is given and the type's policy has
    /// `checkpoint_on_failure`, a `failure` checkpoint is saved once the
    /// transition has been applied. A rejected caller leaves the stored
    /// checkpoint untouched.
    pub async fn fail(
        &self,
        operation_id: &str,
        error_message: &str,
        failure_state: Option<Document>,
    ) -> Result<Operation> {
        self.fail_as(operation_id, None, error_message, failure_state)
            .await
    }

    /// [`fail`](Self::fail), optionally asserting the owner.
    pub async fn fail_as(
        &self,
        operation_id: &str,
        worker_id: Option<&str>,
        error_message: &str,
        failure_state: Option<Document>,
    ) -> Result<Operation> {
        self.finish_failed(
            operation_id,
            Transition::to(OperationStatus::Failed)
                .expecting_worker(worker_id.map(str::to_string))
                .with_error(error_message),
            failure_state,
        )
        .await
    }

    /// Apply a failure a worker reported after the fact, keeping its finish
    /// time.
    pub async fn fail_reported(
        &self,
        operation_id: &str,
        error_message: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Operation> {
        self.finish_failed(
            operation_id,
            Transition::to(OperationStatus::Failed)
                .with_error(error_message)
                .completed_at(completed_at),
            None,
        )
        .await
    }

    async fn finish_failed(
        &self,
        operation_id: &str,
        transition: Transition,
        failure_state: Option<Document>,
    ) -> Result<Operation> {
        let op = self.transition(operation_id, transition).await?;

        let policy = self.checkpoints.policies().for_type(&op.operation_type);
        if policy.checkpoint_on_failure
            && let Some(state) = failure_state.as_ref()
            && let Err(e) = self
                .checkpoints
                .save_checkpoint(operation_id, CheckpointType::Failure, state, None)
                .await
        {
            warn!(
                operation_id = %operation_id,
                error = %e,
                "Failed to save failure checkpoint"
            );
        }

        Ok(op)
    }

    /// Cancel an operation and, best effort, its active children.
    ///
    /// Only `running` and `pending_reconciliation` operations can be cancelled.
    pub async fn cancel(&self, operation_id: &str, reason: &str) -> Result<CancelOutcome> {
        let op = self
            .transition(
                operation_id,
                Transition::to(OperationStatus::Cancelled).with_error(reason),
            )
            .await?;

        let children = op.child_operation_ids();
        let child_operation_id = children.last().cloned();
        let cancelled_children = self.cancel_descendants(operation_id, children, reason).await;

        Ok(CancelOutcome {
            cancelled: true,
            operation_id: operation_id.to_string(),
            child_operation_id,
            cancelled_children,
        })
    }

    async fn cancel_descendants(
        &self,
        root: &str,
        children: Vec<String>,
        reason: &str,
    ) -> Vec<String> {
        let mut cancelled = Vec::new();
        let mut seen: HashSet<String> = HashSet::from([root.to_string()]);
        let mut queue = children;

        while let Some(child_id) = queue.pop() {
            if !seen.insert(child_id.clone()) {
                continue;
            }
            let child = match self.find(&child_id).await {
                Ok(Some(child)) => child,
                Ok(None) => {
                    warn!(parent = %root, child = %child_id, "Linked child operation not found");
                    continue;
                }
                Err(e) => {
                    warn!(parent = %root, child = %child_id, error = %e, "Failed to load child operation");
                    continue;
                }
            };

            queue.extend(child.child_operation_ids());

            if !child.status.can_transition_to(OperationStatus::Cancelled) {
                continue;
            }
            match self
                .transition(
                    &child_id,
                    Transition::to(OperationStatus::Cancelled).with_error(reason),
                )
                .await
            {
                Ok(_) => cancelled.push(child_id),
                Err(e) => {
                    warn!(parent = %root, child = %child_id, error = %e, "Failed to cancel child operation")
                }
            }
        }

        cancelled
    }

    /// Append `child_id` to the parent's `child_operation_ids`.
    ///
    /// Idempotent for an already linked child.
    pub async fn link_child(&self, parent_id: &str, child_id: &str) -> Result<()> {
        if parent_id == child_id {
            return Err(CoreError::validation(
                "child_operation_id",
                "an operation cannot be its own child",
            ));
        }
        self.get(child_id).await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let parent = self.get(parent_id).await?;
            let mut children = parent.child_operation_ids();
            if children.iter().any(|c| c == child_id) {
                return Ok(());
            }
            children.push(child_id.to_string());

            let expected = parent.metadata.to_value();
            let mut metadata = parent.metadata;
            metadata
                .as_map_mut()
                .insert(CHILD_OPERATION_IDS_KEY.to_string(), Value::from(children));
            let metadata = Document::from_value(metadata.into_value())?;

            if self
                .persistence
                .replace_metadata(parent_id, &expected, &metadata.to_value())
                .await?
            {
                debug!(parent = %parent_id, child = %child_id, "Linked child operation");
                return Ok(());
            }
        }

        Err(CoreError::DatabaseError {
            operation: "link_child".to_string(),
            details: format!("metadata of '{}' changed concurrently", parent_id),
        })
    }

    /// Reclaim a `running` or `pending_reconciliation` operation for `worker_id`.
    ///
    /// Applies only if the stored owner still equals `observed_owner`.
    pub async fn reclaim(
        &self,
        operation_id: &str,
        worker_id: &str,
        observed_owner: Option<&str>,
    ) -> Result<bool> {
        let claimed = self
            .persistence
            .claim_operation(&ClaimUpdate {
                operation_id,
                worker_id,
                expected_owner: observed_owner,
                now: Utc::now(),
            })
            .await?;
        if claimed {
            info!(
                operation_id = %operation_id,
                worker_id = %worker_id,
                previous_owner = ?observed_owner,
                "Operation reclaimed"
            );
        }
        Ok(claimed)
    }

    /// Demote `running` operations silent for longer than `threshold`.
    ///
    /// Each operation is demoted by exactly one caller.
    pub async fn demote_stale(&self, threshold: chrono::Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let demoted = self
            .persistence
            .demote_stale_operations(now - threshold, now)
            .await?;
        for id in &demoted {
            warn!(operation_id = %id, "Stale running operation moved to pending_reconciliation");
        }
        Ok(demoted)
    }

    /// Fail operations left in `pending_reconciliation` longer than `grace`.
    pub async fn fail_orphaned(&self, grace: chrono::Duration, message: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let failed = self
            .persistence
            .fail_orphaned_operations(now - grace, message, now)
            .await?;
        for id in &failed {
            warn!(operation_id = %id, "Orphaned operation failed");
        }
        Ok(failed)
    }
}

/// Caller-supplied ids become artifact directory names, so they are
/// restricted to a filesystem-safe alphabet.
pub fn validate_operation_id(operation_id: &str) -> Result<()> {
    if operation_id.len() > MAX_OPERATION_ID_LEN {
        return Err(CoreError::validation(
            "operation_id",
            format!("must be at most {} characters", MAX_OPERATION_ID_LEN),
        ));
    }
    validate_path_segment("operation_id", operation_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoints::{ArtifactStore, CheckpointPolicies, CheckpointPolicy};
    use crate::persistence::SqlitePersistence;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_registry_with(
        policies: CheckpointPolicies,
    ) -> (OperationRegistry, Arc<SqlitePersistence>, tempfile::TempDir) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::SQLITE.run(&pool).await.unwrap();
        let persistence = Arc::new(SqlitePersistence::new(pool));
        let dir = tempfile::tempdir().unwrap();
        let checkpoints =
            CheckpointStore::new(persistence.clone(), ArtifactStore::new(dir.path()), policies);
        (
            OperationRegistry::new(persistence.clone(), checkpoints),
            persistence,
            dir,
        )
    }

    async fn test_registry() -> (OperationRegistry, Arc<SqlitePersistence>, tempfile::TempDir) {
        test_registry_with(CheckpointPolicies::default()).await
    }

    fn training() -> OperationType {
        OperationType::new(OperationType::TRAINING).unwrap()
    }

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    async fn running(registry: &OperationRegistry, worker: &str) -> String {
        let id = registry
            .create(training(), doc(json!({"model": "lstm"})))
            .await
            .unwrap();
        registry.start(&id, Some(worker)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let (registry, _, _dir) = test_registry().await;
        let id = registry.create(training(), Document::new()).await.unwrap();
        assert!(id.starts_with("op_"));

        let op = registry.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.progress_percent, 0.0);
        assert!(op.worker_id.is_none());
        assert!(!op.is_backend_local);
    }

    #[tokio::test]
    async fn test_create_with_caller_id() {
        let (registry, _, _dir) = test_registry().await;
        let op = registry
            .create_with(NewOperation::new(training(), Document::new()).with_id("train-42").backend_local())
            .await
            .unwrap();
        assert_eq!(op.operation_id, "train-42");
        assert!(op.is_backend_local);

        let dup = registry
            .create_with(NewOperation::new(training(), Document::new()).with_id("train-42"))
            .await
            .unwrap_err();
        assert!(matches!(dup, CoreError::OperationAlreadyExists { .. }));

        let bad = registry
            .create_with(NewOperation::new(training(), Document::new()).with_id("../etc"))
            .await
            .unwrap_err();
        assert!(matches!(bad, CoreError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn test_illegal_transitions_leave_row_unchanged() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;
        registry.complete(&id, None).await.unwrap();

        for to in OperationStatus::ALL {
            let err = registry.transition(&id, Transition::to(to)).await.unwrap_err();
            assert!(matches!(err, CoreError::InvalidTransition { .. }), "{:?}", err);
        }
        let op = registry.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_pending_cannot_be_demoted_or_cancelled() {
        let (registry, _, _dir) = test_registry().await;
        let id = registry.create(training(), Document::new()).await.unwrap();

        let err = registry
            .transition(&id, Transition::to(OperationStatus::PendingReconciliation))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert!(registry.cancel(&id, "nope").await.is_err());
        assert_eq!(registry.get(&id).await.unwrap().status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn test_start_sets_owner_and_timestamps() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;
        let op = registry.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Running);
        assert_eq!(op.worker_id.as_deref(), Some("w1"));
        assert!(op.started_at.is_some());
        assert!(op.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_rules() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;

        let op = registry
            .record_heartbeat(
                &id,
                Some("w1"),
                Progress {
                    percent: Some(140.0),
                    message: Some("epoch 7".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(op.progress_percent, 100.0);
        assert_eq!(op.progress_message.as_deref(), Some("epoch 7"));

        let err = registry
            .record_heartbeat(&id, Some("w2"), Progress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::OwnershipConflict { .. }));

        registry.cancel(&id, "stop").await.unwrap();
        let before = registry.get(&id).await.unwrap();
        let err = registry
            .record_heartbeat(&id, Some("w1"), Progress::default())
            .await
            .unwrap_err();
        match err {
            CoreError::InvalidOperationState { actual, .. } => assert_eq!(actual, "cancelled"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(registry.get(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_concurrent_cancel_and_complete_single_winner() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;

        let (a, b) = tokio::join!(
            registry.cancel(&id, "user request"),
            registry.complete(&id, Some(doc(json!({"ok": true}))))
        );
        assert_ne!(a.is_ok(), b.is_ok(), "exactly one request must win");

        let op = registry.get(&id).await.unwrap();
        if a.is_ok() {
            assert_eq!(op.status, OperationStatus::Cancelled);
            assert!(op.result.is_none());
        } else {
            assert_eq!(op.status, OperationStatus::Completed);
            assert!(op.error_message.is_none());
        }
    }

    #[tokio::test]
    async fn test_complete_deletes_checkpoint_per_policy() {
        let keep = CheckpointPolicy {
            delete_on_completion: false,
            ..Default::default()
        };
        let policies = CheckpointPolicies::default().with_policy("backtesting", keep);
        let (registry, _, _dir) = test_registry_with(policies).await;

        let id = running(&registry, "w1").await;
        registry
            .checkpoints()
            .save_checkpoint(&id, CheckpointType::Periodic, &doc(json!({"epoch": 1})), None)
            .await
            .unwrap();
        registry.complete(&id, None).await.unwrap();
        assert!(registry.checkpoints().load_checkpoint(&id, false).await.unwrap().is_none());

        let bt = registry
            .create(OperationType::new("backtesting").unwrap(), Document::new())
            .await
            .unwrap();
        registry.start(&bt, Some("w1")).await.unwrap();
        registry
            .checkpoints()
            .save_checkpoint(&bt, CheckpointType::Periodic, &Document::new(), None)
            .await
            .unwrap();
        registry.complete(&bt, None).await.unwrap();
        assert!(registry.checkpoints().load_checkpoint(&bt, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_saves_failure_checkpoint() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;

        let op = registry
            .fail(&id, "out of memory", Some(doc(json!({"epoch": 9}))))
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error_message.as_deref(), Some("out of memory"));

        let cp = registry.checkpoints().load_checkpoint(&id, false).await.unwrap().unwrap();
        assert_eq!(cp.info.checkpoint_type, CheckpointType::Failure);
        assert_eq!(cp.state, doc(json!({"epoch": 9})));
    }

    #[tokio::test]
    async fn test_fail_on_terminal_does_not_checkpoint() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;
        registry.complete(&id, None).await.unwrap();

        assert!(registry.fail(&id, "late", Some(Document::new())).await.is_err());
        assert!(registry.checkpoints().load_checkpoint(&id, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_from_non_owner_keeps_owner_checkpoint() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;
        registry
            .checkpoints()
            .save_checkpoint(&id, CheckpointType::Periodic, &doc(json!({"epoch": 30})), None)
            .await
            .unwrap();

        let err = registry
            .fail_as(&id, Some("w2"), "boom", Some(doc(json!({"epoch": 0}))))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::OwnershipConflict { .. }));
        assert_eq!(registry.get(&id).await.unwrap().status, OperationStatus::Running);

        let cp = registry.checkpoints().load_checkpoint(&id, false).await.unwrap().unwrap();
        assert_eq!(cp.info.checkpoint_type, CheckpointType::Periodic);
        assert_eq!(cp.state, doc(json!({"epoch": 30})));
    }

    #[tokio::test]
    async fn test_reported_finish_time_is_kept() {
        let (registry, _, _dir) = test_registry().await;
        let finished = "2020-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let id = running(&registry, "w1").await;
        let op = registry
            .complete_reported(&id, Some(doc(json!({"accuracy": 0.83}))), Some(finished))
            .await
            .unwrap();
        assert_eq!(op.completed_at, Some(finished));

        let id = running(&registry, "w1").await;
        let op = registry.fail_reported(&id, "oom", Some(finished)).await.unwrap();
        assert_eq!(op.completed_at, Some(finished));

        // A finish time ahead of the clock is not trusted.
        let id = running(&registry, "w1").await;
        let future = Utc::now() + chrono::Duration::hours(1);
        let op = registry.complete_reported(&id, None, Some(future)).await.unwrap();
        assert!(op.completed_at.unwrap() <= Utc::now());

        let id = running(&registry, "w1").await;
        let before = Utc::now();
        let op = registry.complete_reported(&id, None, None).await.unwrap();
        assert!(op.completed_at.unwrap() >= before);
    }

    #[tokio::test]
    async fn test_cancel_cascades_to_active_children() {
        let (registry, _, _dir) = test_registry().await;
        let parent = running(&registry, "w1").await;
        let finished = running(&registry, "w2").await;
        let active = running(&registry, "w3").await;
        registry.complete(&finished, None).await.unwrap();

        registry.link_child(&parent, &finished).await.unwrap();
        registry.link_child(&parent, &active).await.unwrap();
        registry.link_child(&parent, &active).await.unwrap();

        let parent_op = registry.get(&parent).await.unwrap();
        assert_eq!(parent_op.child_operation_ids(), vec![finished.clone(), active.clone()]);
        assert_eq!(parent_op.metadata.get("model"), Some(&json!("lstm")));

        let outcome = registry.cancel(&parent, "user request").await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.child_operation_id.as_deref(), Some(active.as_str()));
        assert_eq!(outcome.cancelled_children, vec![active.clone()]);

        assert_eq!(registry.get(&active).await.unwrap().status, OperationStatus::Cancelled);
        assert_eq!(registry.get(&finished).await.unwrap().status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_reclaim_from_pending_reconciliation() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;
        registry
            .transition(&id, Transition::to(OperationStatus::PendingReconciliation))
            .await
            .unwrap();
        let op = registry.get(&id).await.unwrap();
        assert_eq!(op.reconciliation_status, Some(ReconciliationStatus::Unreconciled));
        assert!(op.reconciliation_started_at.is_some());

        assert!(!registry.reclaim(&id, "w2", Some("someone-else")).await.unwrap());
        assert!(registry.reclaim(&id, "w2", Some("w1")).await.unwrap());

        let op = registry.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Running);
        assert_eq!(op.worker_id.as_deref(), Some("w2"));
        assert_eq!(op.reconciliation_status, Some(ReconciliationStatus::Reconciled));
        assert!(op.reconciliation_started_at.is_none());
    }

    #[tokio::test]
    async fn test_demote_stale_uses_start_when_never_heartbeated() {
        let (registry, p, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;
        sqlx::query("UPDATE operations SET last_heartbeat_at = NULL, started_at = ?1 WHERE operation_id = ?2")
            .bind(Utc::now() - chrono::Duration::seconds(600))
            .bind(&id)
            .execute(p.pool())
            .await
            .unwrap();

        let demoted = registry.demote_stale(chrono::Duration::seconds(120)).await.unwrap();
        assert_eq!(demoted, vec![id.clone()]);
        assert!(registry.demote_stale(chrono::Duration::seconds(120)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_owner_guard_on_complete() {
        let (registry, _, _dir) = test_registry().await;
        let id = running(&registry, "w1").await;
        let err = registry.complete_as(&id, Some("w2"), None).await.unwrap_err();
        assert!(matches!(err, CoreError::OwnershipConflict { .. }));
        registry.complete_as(&id, Some("w1"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_active_only() {
        let (registry, _, _dir) = test_registry().await;
        let done = running(&registry, "w1").await;
        registry.complete(&done, None).await.unwrap();
        let _pending = registry.create(training(), Document::new()).await.unwrap();
        let _run = running(&registry, "w2").await;

        let page = registry
            .list(&OperationFilter {
                active_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert!(page.operations.iter().all(|op| op.status.is_active()));

        let page = registry
            .list(&OperationFilter {
                status: Some(OperationStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.operations.len(), 1);
        assert_eq!(page.operations[0].operation_id, done);
    }
}
