// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker HTTP endpoints called by the coordinator.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use keel_core::protocol::{
    ErrorBody, ShutdownNotice, StartOperationRequest, StartOperationResponse, WorkerCancelRequest,
    WorkerHealthResponse, worker_paths,
};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::error::SdkError;
use crate::worker::Worker;

const DEFAULT_CANCEL_REASON: &str = "cancelled by coordinator";

/// SDK error rendered as the shared `ErrorBody`.
pub struct ApiError(SdkError);

impl From<SdkError> for ApiError {
    fn from(err: SdkError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, retryable) = match &self.0 {
            SdkError::Busy(_) => (StatusCode::CONFLICT, "WORKER_BUSY", true),
            SdkError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", true),
            SdkError::UnsupportedOperation(_) | SdkError::Core(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_REQUEST", false)
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", false),
        };
        let body = ErrorBody {
            code: code.to_string(),
            message: self.0.to_string(),
            retryable,
        };
        if status.is_server_error() {
            error!(code = %body.code, message = %body.message, "Request failed");
        } else {
            warn!(code = %body.code, message = %body.message, "Request rejected");
        }
        (status, Json(body)).into_response()
    }
}

/// Router serving the worker endpoints.
pub fn router(worker: Arc<Worker>) -> Router {
    Router::new()
        .route(worker_paths::HEALTH, get(health))
        .route(worker_paths::START_OPERATION, post(start_operation))
        .route("/operations/{id}/cancel", post(cancel_operation))
        .route(worker_paths::SHUTDOWN_NOTICE, post(shutdown_notice))
        .with_state(worker)
}

async fn health(State(worker): State<Arc<Worker>>) -> Json<WorkerHealthResponse> {
    Json(worker.health().await)
}

async fn start_operation(
    State(worker): State<Arc<Worker>>,
    Json(request): Json<StartOperationRequest>,
) -> Result<Json<StartOperationResponse>, ApiError> {
    let operation_id = request.operation_id.clone();
    worker.start_operation(request).await?;
    Ok(Json(StartOperationResponse {
        accepted: true,
        operation_id,
    }))
}

async fn cancel_operation(
    State(worker): State<Arc<Worker>>,
    Path(id): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    // An empty or unparsable body falls back to the default reason.
    let reason = serde_json::from_slice::<WorkerCancelRequest>(&body)
        .ok()
        .and_then(|b| b.reason)
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
    if worker.cancel_operation(&id, &reason).await {
        (StatusCode::OK, Json(json!({"operation_id": id, "cancelled": true})))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"operation_id": id, "cancelled": false})))
    }
}

async fn shutdown_notice(
    State(worker): State<Arc<Worker>>,
    Json(notice): Json<ShutdownNotice>,
) -> StatusCode {
    info!(
        reason = %notice.reason,
        sent_at = %notice.sent_at,
        "Coordinator is shutting down, will re-register when it returns"
    );
    worker.registration().request();
    StatusCode::OK
}
