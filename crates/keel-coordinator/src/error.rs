// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keel-coordinator.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keel_core::error::CoreError;
use keel_core::lock::LockError;
use keel_core::protocol::ErrorBody;
use thiserror::Error;
use tracing::{error, warn};

/// Coordinator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Core lifecycle operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The data directory lock could not be taken.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// No healthy idle worker of the requested type.
    #[error("No idle healthy worker of type '{worker_type}'")]
    NoWorkerAvailable { worker_type: String },

    /// The selected worker reported it is already busy.
    #[error("Worker '{worker_id}' is busy")]
    WorkerBusy { worker_id: String },

    /// The worker could not be reached after all retries.
    #[error("Worker '{worker_id}' unreachable: {details}")]
    WorkerUnreachable { worker_id: String, details: String },

    /// The admission gate refused the assignment.
    #[error("Admission denied: {reason}")]
    AdmissionDenied { reason: String },

    /// The coordinator is shutting down.
    #[error("Coordinator is shutting down")]
    ShuttingDown,

    /// Worker is not registered.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) | Error::Migration(_) => "DATABASE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Core(e) => e.error_code(),
            Error::Lock(_) => "LOCK_ERROR",
            Error::NoWorkerAvailable { .. } => "NO_WORKER_AVAILABLE",
            Error::WorkerBusy { .. } => "WORKER_BUSY",
            Error::WorkerUnreachable { .. } => "WORKER_UNREACHABLE",
            Error::AdmissionDenied { .. } => "ADMISSION_DENIED",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::WorkerNotFound(_) => "WORKER_NOT_FOUND",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Core(e) => e.is_retryable(),
            Error::Database(_)
            | Error::NoWorkerAvailable { .. }
            | Error::WorkerBusy { .. }
            | Error::WorkerUnreachable { .. }
            | Error::ShuttingDown => true,
            _ => false,
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Core(e) => match e {
                CoreError::OperationNotFound { .. } | CoreError::CheckpointNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                CoreError::OperationAlreadyExists { .. }
                | CoreError::InvalidTransition { .. }
                | CoreError::InvalidOperationState { .. }
                | CoreError::OwnershipConflict { .. } => StatusCode::CONFLICT,
                CoreError::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                CoreError::DatabaseError { .. } | CoreError::IoError { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Database(_)
            | Error::NoWorkerAvailable { .. }
            | Error::WorkerUnreachable { .. }
            | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::WorkerBusy { .. } => StatusCode::CONFLICT,
            Error::AdmissionDenied { .. } => StatusCode::FORBIDDEN,
            Error::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire body for this error.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.body();
        if status.is_server_error() {
            error!(code = %body.code, message = %body.message, "Request failed");
        } else {
            warn!(code = %body.code, message = %body.message, "Request rejected");
        }
        (status, Json(body)).into_response()
    }
}

/// Result type using coordinator Error.
pub type Result<T> = std::result::Result<T, Error>;
