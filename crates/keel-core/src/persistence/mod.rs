// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for keel-core.
//!
//! This module defines the persistence abstraction and backend implementations.
//! Every status mutation is a compare-and-set: the `UPDATE` carries the
//! expected current status (and owner where relevant) and reports whether a
//! row was affected.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;

use crate::error::CoreError;

/// Operation record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationRecord {
    /// Unique identifier for the operation.
    pub operation_id: String,
    /// Kind of work (training, backtesting, ...).
    pub operation_type: String,
    /// Current status string.
    pub status: String,
    /// Owning worker, if any.
    pub worker_id: Option<String>,
    /// Whether the backend itself executes the operation.
    pub is_backend_local: bool,
    /// When the operation was created.
    pub created_at: DateTime<Utc>,
    /// When the operation first started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the operation reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Progress, 0 to 100.
    pub progress_percent: f64,
    /// Free-form progress note.
    pub progress_message: Option<String>,
    /// Caller-defined metadata object.
    pub metadata: Json<Value>,
    /// Result payload once completed.
    pub result: Option<Json<Value>>,
    /// Failure or cancellation reason.
    pub error_message: Option<String>,
    /// Last heartbeat received while running.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Reconciliation outcome, set once the operation was demoted.
    pub reconciliation_status: Option<String>,
    /// When the operation entered pending_reconciliation.
    pub reconciliation_started_at: Option<DateTime<Utc>>,
}

/// Checkpoint record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRecord {
    /// Operation this checkpoint belongs to.
    pub operation_id: String,
    /// periodic, shutdown, manual, or failure.
    pub checkpoint_type: String,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
    /// Resumable state.
    pub state: Json<Value>,
    /// Published artifact directory, if any.
    pub artifacts_path: Option<String>,
    /// Size of the serialized state.
    pub state_size_bytes: Option<i32>,
    /// Recursive size of the artifact directory.
    pub artifacts_size_bytes: Option<i64>,
}

/// Values for a new operation row.
#[derive(Debug, Clone)]
pub struct NewOperationRow {
    pub operation_id: String,
    pub operation_type: String,
    pub is_backend_local: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Filter options for listing operations.
#[derive(Debug, Clone, Default)]
pub struct ListOperationsFilter {
    /// Only this operation type.
    pub operation_type: Option<String>,
    /// Only this status.
    pub status: Option<String>,
    /// Only pending, running, and pending_reconciliation.
    pub active_only: bool,
    /// Only operations owned by this worker.
    pub worker_id: Option<String>,
}

/// A compare-and-set status change.
///
/// Applied only when the stored status equals `expected_status`. Column side
/// effects follow the target status: entering `running` refreshes the owner
/// and heartbeat, entering `pending_reconciliation` stamps
/// `reconciliation_started_at`, entering a terminal status stamps
/// `completed_at`.
#[derive(Debug, Clone)]
pub struct StatusUpdate<'a> {
    pub operation_id: &'a str,
    pub expected_status: &'a str,
    pub new_status: &'a str,
    pub now: DateTime<Utc>,
    /// Owner to record when entering `running`; `None` keeps the current owner.
    pub worker_id: Option<&'a str>,
    pub result: Option<&'a Value>,
    pub error_message: Option<&'a str>,
    pub reconciliation_status: Option<&'a str>,
    /// When set, the update also requires this owner.
    pub expected_worker: Option<&'a str>,
    /// Finish time to record instead of `now` when entering a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl<'a> StatusUpdate<'a> {
    /// A bare status change with no side payload.
    pub fn new(
        operation_id: &'a str,
        expected_status: &'a str,
        new_status: &'a str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            operation_id,
            expected_status,
            new_status,
            now,
            worker_id: None,
            result: None,
            error_message: None,
            reconciliation_status: None,
            expected_worker: None,
            completed_at: None,
        }
    }
}

/// Values written by a heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatUpdate<'a> {
    pub operation_id: &'a str,
    /// Expected owner; compared NULL-safely.
    pub worker_id: Option<&'a str>,
    pub progress_percent: Option<f64>,
    pub progress_message: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// A reclaim of a running or demoted operation by a worker.
#[derive(Debug, Clone)]
pub struct ClaimUpdate<'a> {
    pub operation_id: &'a str,
    pub worker_id: &'a str,
    /// Owner the caller observed; the claim applies only if it is unchanged.
    pub expected_owner: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Values for a checkpoint upsert.
#[derive(Debug, Clone)]
pub struct CheckpointRow<'a> {
    pub operation_id: &'a str,
    pub checkpoint_type: &'a str,
    pub state: &'a Value,
    pub artifacts_path: Option<&'a str>,
    pub state_size_bytes: i32,
    pub artifacts_size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Persistence interface used by the registry, checkpoint store, and coordinator.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // Operations

    /// Insert a new `pending` operation. A duplicate id is `OperationAlreadyExists`.
    async fn insert_operation(&self, row: &NewOperationRow) -> Result<(), CoreError>;

    async fn get_operation(&self, operation_id: &str)
    -> Result<Option<OperationRecord>, CoreError>;

    /// Newest first.
    async fn list_operations(
        &self,
        filter: &ListOperationsFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OperationRecord>, CoreError>;

    async fn count_operations(&self, filter: &ListOperationsFilter) -> Result<i64, CoreError>;

    /// Apply a compare-and-set status change. Returns `true` if a row changed.
    async fn update_status(&self, update: &StatusUpdate<'_>) -> Result<bool, CoreError>;

    /// Record a heartbeat on a `running` operation owned by `worker_id`.
    async fn record_heartbeat(&self, update: &HeartbeatUpdate<'_>) -> Result<bool, CoreError>;

    /// Move a `running` or `pending_reconciliation` operation to `running` under a new owner.
    async fn claim_operation(&self, claim: &ClaimUpdate<'_>) -> Result<bool, CoreError>;

    /// Replace metadata if it still equals `expected`.
    async fn replace_metadata(
        &self,
        operation_id: &str,
        expected: &Value,
        metadata: &Value,
    ) -> Result<bool, CoreError>;

    /// Demote every `running` operation whose latest sign of life is older
    /// than `cutoff`. Returns the ids demoted by this call.
    async fn demote_stale_operations(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError>;

    /// Fail every `pending_reconciliation` operation demoted before `cutoff`.
    /// Returns the ids failed by this call.
    async fn fail_orphaned_operations(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError>;

    // Checkpoints

    /// Insert or replace the operation's checkpoint. Returns the previous
    /// artifacts path when one was replaced.
    async fn upsert_checkpoint(&self, row: &CheckpointRow<'_>) -> Result<Option<String>, CoreError>;

    async fn get_checkpoint(
        &self,
        operation_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError>;

    /// Delete and return the operation's checkpoint.
    async fn delete_checkpoint(
        &self,
        operation_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError>;

    /// Delete up to `limit` checkpoints created before `cutoff`, oldest first.
    async fn delete_checkpoints_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CheckpointRecord>, CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Map a unique-constraint violation on insert to `OperationAlreadyExists`.
pub(crate) fn map_insert_error(err: sqlx::Error, operation_id: &str) -> CoreError {
    if let Some(db_err) = err.as_database_error()
        && db_err.is_unique_violation()
    {
        return CoreError::OperationAlreadyExists {
            operation_id: operation_id.to_string(),
        };
    }
    CoreError::DatabaseError {
        operation: "insert_operation".to_string(),
        details: err.to_string(),
    }
}

/// Map a foreign-key violation on checkpoint upsert to `OperationNotFound`.
pub(crate) fn map_checkpoint_error(err: sqlx::Error, operation_id: &str) -> CoreError {
    if let Some(db_err) = err.as_database_error()
        && db_err.is_foreign_key_violation()
    {
        return CoreError::OperationNotFound {
            operation_id: operation_id.to_string(),
        };
    }
    CoreError::CheckpointSaveFailed {
        operation_id: operation_id.to_string(),
        reason: err.to_string(),
    }
}
