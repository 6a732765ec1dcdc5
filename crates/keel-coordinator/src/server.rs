// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator HTTP API.
//!
//! JSON over HTTP under `/api/v1`, plus a bare `GET /health` for liveness
//! probes. Errors are rendered by [`Error`]'s `IntoResponse` as
//! `{code, message, retryable}`.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use keel_core::error::CoreError;
use keel_core::protocol::{
    API_PREFIX, CancelRequest, CancelResponse, CheckpointResponse, CompleteRequest,
    CreateOperationRequest, DispatchRequest, DispatchResponse, FailRequest, HeartbeatAck,
    HeartbeatRequest, ListOperationsQuery, RegisterWorkerRequest, RegisterWorkerResponse,
    SaveCheckpointRequest, decode_artifacts, encode_artifacts,
};
use keel_core::{
    CheckpointInfo, NewOperation, Operation, OperationFilter, OperationPage, OperationType,
    Progress,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::CoordinatorContext;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::local_executor::LocalExecutor;
use crate::reconciliation::ReconciliationEngine;
use crate::worker_registry::{Worker, WorkerRegistration};

/// Worker id reported when a backend-local operation is dispatched.
pub const LOCAL_WORKER_ID: &str = "backend-local";

const DEFAULT_CANCEL_REASON: &str = "cancelled by request";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<CoordinatorContext>,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub local: Arc<LocalExecutor>,
}

/// Build the coordinator router.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/operations", post(create_operation).get(list_operations))
        .route("/operations/{id}", get(get_operation))
        .route("/operations/{id}/cancel", post(cancel_operation))
        .route("/operations/{id}/dispatch", post(dispatch_operation))
        .route("/operations/{id}/heartbeat", post(heartbeat))
        .route("/operations/{id}/complete", post(complete_operation))
        .route("/operations/{id}/fail", post(fail_operation))
        .route(
            "/operations/{id}/checkpoint",
            get(load_checkpoint).put(save_checkpoint),
        )
        .route("/workers/register", post(register_worker))
        .route("/workers", get(list_workers))
        .route("/health", get(health));

    Router::new()
        .route("/health", get(health))
        .nest(API_PREFIX, api)
        .with_state(state)
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub shutting_down: bool,
    pub registered_workers: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        shutting_down: state.ctx.is_shutting_down(),
        registered_workers: state.ctx.workers.list().await.len(),
    })
}

// ============================================================================
// Operations
// ============================================================================

async fn create_operation(
    State(state): State<AppState>,
    Json(req): Json<CreateOperationRequest>,
) -> Result<impl IntoResponse> {
    let operation_type =
        OperationType::new(req.operation_type).map_err(|e| Error::InvalidRequest(e.to_string()))?;

    if let Some(parent_id) = req.parent_operation_id.as_deref() {
        state.ctx.operations.get(parent_id).await?;
    }

    let mut new = NewOperation::new(operation_type, req.metadata.unwrap_or_default());
    if let Some(id) = req.operation_id {
        new = new.with_id(id);
    }
    if req.is_backend_local {
        new = new.backend_local();
    }
    let op = state.ctx.operations.create_with(new).await?;

    if let Some(parent_id) = req.parent_operation_id.as_deref() {
        state
            .ctx
            .operations
            .link_child(parent_id, &op.operation_id)
            .await?;
    }

    Ok((StatusCode::CREATED, Json(op)))
}

async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<ListOperationsQuery>,
) -> Result<Json<OperationPage>> {
    let defaults = OperationFilter::default();
    let filter = OperationFilter {
        operation_type: query.operation_type,
        status: query.status,
        active_only: query.active_only.unwrap_or(false),
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
    };
    Ok(Json(state.ctx.operations.list(&filter).await?))
}

async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Operation>> {
    Ok(Json(state.ctx.operations.get(&id).await?))
}

async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CancelResponse>> {
    let req: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| Error::InvalidRequest(e.to_string()))?
    };
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

    let outcome = state.ctx.operations.cancel(&id, &reason).await?;

    let mut cancelled = vec![outcome.operation_id.clone()];
    cancelled.extend(outcome.cancelled_children.iter().cloned());
    for operation_id in &cancelled {
        state.local.cancel(operation_id).await;
    }
    state.dispatcher.propagate_cancel(&cancelled, &reason).await;

    info!(
        operation_id = %id,
        reason = %reason,
        cancelled_children = outcome.cancelled_children.len(),
        "Operation cancelled"
    );

    Ok(Json(CancelResponse {
        success: outcome.cancelled,
        operation_id: outcome.operation_id,
        child_operation_id: outcome.child_operation_id,
    }))
}

async fn dispatch_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>> {
    let op = state.ctx.operations.get(&id).await?;
    if op.is_backend_local {
        state.local.start(&id).await?;
        return Ok(Json(DispatchResponse {
            operation_id: id,
            worker_id: LOCAL_WORKER_ID.to_string(),
        }));
    }

    if req.worker_type.trim().is_empty() {
        return Err(Error::InvalidRequest("worker_type is required".to_string()));
    }
    let assignment = state.dispatcher.assign(&id, &req.worker_type).await?;
    Ok(Json(DispatchResponse {
        operation_id: assignment.operation_id,
        worker_id: assignment.worker_id,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatAck>> {
    let progress = Progress {
        percent: req.progress_percent,
        message: req.progress_message,
    };
    match state
        .ctx
        .operations
        .record_heartbeat(&id, req.worker_id.as_deref(), progress)
        .await
    {
        Ok(op) => {
            if let Some(worker_id) = req.worker_id.as_deref() {
                state.ctx.workers.touch(worker_id).await;
            }
            Ok(Json(HeartbeatAck::for_status(true, op.status)))
        }
        Err(CoreError::InvalidOperationState { .. }) => {
            let op = state.ctx.operations.get(&id).await?;
            debug!(operation_id = %id, status = %op.status, "Heartbeat for non-running operation");
            Ok(Json(HeartbeatAck::for_status(false, op.status)))
        }
        Err(e) => Err(e.into()),
    }
}

async fn complete_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<Operation>> {
    let op = state
        .ctx
        .operations
        .complete_as(&id, req.worker_id.as_deref(), req.result)
        .await?;
    state.ctx.workers.clear_operation(&id).await;
    Ok(Json(op))
}

async fn fail_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Result<Json<Operation>> {
    let op = state
        .ctx
        .operations
        .fail_as(
            &id,
            req.worker_id.as_deref(),
            &req.error_message,
            req.failure_state,
        )
        .await?;
    state.ctx.workers.clear_operation(&id).await;
    Ok(Json(op))
}

// ============================================================================
// Checkpoints
// ============================================================================

async fn save_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SaveCheckpointRequest>,
) -> Result<Json<CheckpointInfo>> {
    let checkpoints = &state.ctx.checkpoints;
    let info = match (req.artifacts, req.artifacts_path) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidRequest(
                "artifacts and artifacts_path are mutually exclusive".to_string(),
            ));
        }
        (Some(encoded), None) => {
            let files = decode_artifacts(&encoded)?;
            checkpoints
                .save_checkpoint_with_artifacts(&id, req.checkpoint_type, &req.state, &files)
                .await?
        }
        (None, path) => {
            checkpoints
                .save_checkpoint(
                    &id,
                    req.checkpoint_type,
                    &req.state,
                    path.as_deref().map(FsPath::new),
                )
                .await?
        }
    };
    Ok(Json(info))
}

#[derive(Debug, Default, Deserialize)]
struct LoadCheckpointQuery {
    #[serde(default)]
    load_artifacts: bool,
}

async fn load_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LoadCheckpointQuery>,
) -> Result<Json<CheckpointResponse>> {
    let loaded = state
        .ctx
        .checkpoints
        .load_checkpoint(&id, query.load_artifacts)
        .await?
        .ok_or_else(|| CoreError::CheckpointNotFound {
            operation_id: id.clone(),
        })?;

    Ok(Json(CheckpointResponse {
        info: loaded.info,
        state: loaded.state,
        artifacts: loaded.artifacts.as_ref().map(encode_artifacts),
    }))
}

// ============================================================================
// Workers
// ============================================================================

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<Json<RegisterWorkerResponse>> {
    if state.ctx.is_shutting_down() {
        return Err(Error::ShuttingDown);
    }
    if req.worker_id.trim().is_empty() || req.worker_type.trim().is_empty() {
        return Err(Error::InvalidRequest(
            "worker_id and worker_type are required".to_string(),
        ));
    }
    if req.endpoint_url.trim().is_empty() {
        return Err(Error::InvalidRequest("endpoint_url is required".to_string()));
    }

    let worker = state
        .ctx
        .workers
        .register(WorkerRegistration {
            worker_id: req.worker_id.clone(),
            worker_type: req.worker_type,
            endpoint_url: req.endpoint_url,
        })
        .await;

    let reconciliation = state
        .reconciliation
        .reconcile(
            &req.worker_id,
            req.current_operation_id.as_deref(),
            &req.completed_operations,
        )
        .await?;

    Ok(Json(RegisterWorkerResponse {
        worker_id: worker.worker_id,
        registered_at: worker.registered_at,
        reconciliation,
    }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<Worker>> {
    Json(state.ctx.workers.list().await)
}
