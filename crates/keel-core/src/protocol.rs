// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON wire types shared by the coordinator HTTP API and the worker SDK.
//!
//! Two directions:
//! - worker/caller -> coordinator, under [`API_PREFIX`]
//! - coordinator -> worker, at the worker's registered endpoint

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoints::CheckpointInfo;
use crate::error::CoreError;
use crate::types::{CheckpointType, Document, OperationStatus};

/// Prefix of every coordinator API route.
pub const API_PREFIX: &str = "/api/v1";

/// Worker endpoint paths, relative to the worker's endpoint URL.
pub mod worker_paths {
    pub const HEALTH: &str = "/health";
    pub const START_OPERATION: &str = "/operations/start";
    pub const SHUTDOWN_NOTICE: &str = "/shutdown-notice";

    /// `POST` target for cancelling an operation on a worker.
    pub fn cancel_operation(operation_id: &str) -> String {
        format!("/operations/{}/cancel", operation_id)
    }
}

/// Error payload returned by every non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOperationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub operation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Document>,
    #[serde(default)]
    pub is_backend_local: bool,
    /// Link the new operation as a child of this parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_operation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOperationsQuery {
    pub operation_type: Option<String>,
    pub status: Option<OperationStatus>,
    pub active_only: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub operation_id: String,
    pub child_operation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Ignored for backend-local operations.
    #[serde(default)]
    pub worker_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub operation_id: String,
    pub worker_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub progress_percent: Option<f64>,
    #[serde(default)]
    pub progress_message: Option<String>,
}

/// Heartbeat acknowledgement.
///
/// `accepted = false` means the operation is no longer running; the worker
/// learns the actual status (for example `cancelled`) from `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub accepted: bool,
    pub status: OperationStatus,
    pub cancel_requested: bool,
}

impl HeartbeatAck {
    pub fn for_status(accepted: bool, status: OperationStatus) -> Self {
        Self {
            accepted,
            status,
            cancel_requested: status == OperationStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub result: Option<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    pub error_message: String,
    /// State to keep as a `failure` checkpoint.
    #[serde(default)]
    pub failure_state: Option<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveCheckpointRequest {
    pub checkpoint_type: CheckpointType,
    pub state: Document,
    /// Directory the caller already wrote on the coordinator's host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_path: Option<String>,
    /// Artifact files to publish, base64-encoded by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointResponse {
    #[serde(flatten)]
    pub info: CheckpointInfo,
    pub state: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<BTreeMap<String, String>>,
}

/// Base64-encode artifact contents for transport.
pub fn encode_artifacts(files: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, String> {
    files
        .iter()
        .map(|(name, bytes)| (name.clone(), STANDARD.encode(bytes)))
        .collect()
}

/// Decode transported artifact contents.
pub fn decode_artifacts(files: &BTreeMap<String, String>) -> Result<BTreeMap<String, Vec<u8>>, CoreError> {
    files
        .iter()
        .map(|(name, encoded)| {
            STANDARD
                .decode(encoded)
                .map(|bytes| (name.clone(), bytes))
                .map_err(|e| CoreError::ValidationError {
                    field: format!("artifacts.{}", name),
                    message: e.to_string(),
                })
        })
        .collect()
}

// ============================================================================
// Worker registration and reconciliation
// ============================================================================

/// Outcome a worker reports for an operation it finished while the backend
/// was unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOperationReport {
    pub operation_id: String,
    pub status: ReportedStatus,
    #[serde(default)]
    pub result: Option<Document>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    pub worker_type: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub current_operation_id: Option<String>,
    #[serde(default)]
    pub completed_operations: Vec<CompletedOperationReport>,
}

/// Why a report could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// The reported operation does not exist.
    UnknownOperation,
    /// The worker claims an operation that is already terminal.
    StaleReport,
    /// A completion report arrived for an operation owned by another worker.
    ForeignOwner,
}

/// A report that disagreed with stored state and was not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub operation_id: String,
    pub kind: AnomalyKind,
    pub stored_status: Option<OperationStatus>,
    pub message: String,
}

/// A claim refused because a healthy worker already owns the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRejected {
    pub operation_id: String,
    pub owner: String,
}

/// An outcome applied from `completed_operations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOutcome {
    pub operation_id: String,
    pub status: OperationStatus,
}

/// What reconciliation did for one registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Operation now running under the registering worker.
    pub reclaimed: Option<String>,
    pub applied: Vec<AppliedOutcome>,
    pub anomalies: Vec<Anomaly>,
    pub claim_rejected: Option<ClaimRejected>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: String,
    pub registered_at: DateTime<Utc>,
    pub reconciliation: ReconciliationReport,
}

// ============================================================================
// Coordinator -> worker
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOperationRequest {
    pub operation_id: String,
    pub operation_type: String,
    pub metadata: Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOperationResponse {
    pub accepted: bool,
    pub operation_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownNotice {
    pub reason: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthResponse {
    pub worker_id: String,
    pub status: String,
    pub current_operation_id: Option<String>,
}
