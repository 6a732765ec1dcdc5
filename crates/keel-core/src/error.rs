// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keel-core.
//!
//! Provides a unified error type that maps to API error responses.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while operating on operations and checkpoints.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CoreError {
    /// Operation was not found in the database.
    OperationNotFound {
        /// The operation ID that was not found.
        operation_id: String,
    },

    /// Operation already exists (duplicate caller-supplied id).
    OperationAlreadyExists {
        /// The operation ID that already exists.
        operation_id: String,
    },

    /// The requested status edge is not in the transition table.
    InvalidTransition {
        /// The operation ID.
        operation_id: String,
        /// The status the operation is currently in.
        from: String,
        /// The status that was requested.
        to: String,
    },

    /// Operation is in an invalid state for the requested operation.
    InvalidOperationState {
        /// The operation ID.
        operation_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// Operation is owned by a different worker.
    OwnershipConflict {
        /// The operation ID.
        operation_id: String,
        /// The worker that currently owns the operation (if any).
        owner: Option<String>,
        /// The worker that attempted the mutation (if any).
        claimant: Option<String>,
    },

    /// No checkpoint is recorded for the operation.
    CheckpointNotFound {
        /// The operation ID.
        operation_id: String,
    },

    /// Checkpoint save failed.
    CheckpointSaveFailed {
        /// The operation ID.
        operation_id: String,
        /// The reason for failure.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Filesystem operation failed (artifacts, lock markers).
    IoError {
        /// The path involved.
        path: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::OperationNotFound { .. } => "OPERATION_NOT_FOUND",
            Self::OperationAlreadyExists { .. } => "OPERATION_ALREADY_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidOperationState { .. } => "INVALID_OPERATION_STATE",
            Self::OwnershipConflict { .. } => "OWNERSHIP_CONFLICT",
            Self::CheckpointNotFound { .. } => "CHECKPOINT_NOT_FOUND",
            Self::CheckpointSaveFailed { .. } => "CHECKPOINT_SAVE_FAILED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::IoError { .. } => "IO_ERROR",
        }
    }

    /// Whether the caller may retry the same request later and expect a different outcome.
    ///
    /// State-machine rejections are final; storage failures are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DatabaseError { .. } | Self::IoError { .. })
    }

    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Self::IoError {
            path: path.as_ref().display().to_string(),
            details: err.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperationNotFound { operation_id } => {
                write!(f, "Operation '{}' not found", operation_id)
            }
            Self::OperationAlreadyExists { operation_id } => {
                write!(f, "Operation '{}' already exists", operation_id)
            }
            Self::InvalidTransition {
                operation_id,
                from,
                to,
            } => {
                write!(
                    f,
                    "Operation '{}' cannot transition from '{}' to '{}'",
                    operation_id, from, to
                )
            }
            Self::InvalidOperationState {
                operation_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Operation '{}' is in invalid state: expected '{}', got '{}'",
                    operation_id, expected, actual
                )
            }
            Self::OwnershipConflict {
                operation_id,
                owner,
                claimant,
            } => {
                write!(
                    f,
                    "Operation '{}' is owned by {} (claimed by {})",
                    operation_id,
                    owner.as_deref().unwrap_or("<none>"),
                    claimant.as_deref().unwrap_or("<none>")
                )
            }
            Self::CheckpointNotFound { operation_id } => {
                write!(f, "No checkpoint found for operation '{}'", operation_id)
            }
            Self::CheckpointSaveFailed {
                operation_id,
                reason,
            } => {
                write!(
                    f,
                    "Failed to save checkpoint for operation '{}': {}",
                    operation_id, reason
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::IoError { path, details } => {
                write!(f, "I/O error on '{}': {}", path, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<crate::types::DocumentError> for CoreError {
    fn from(err: crate::types::DocumentError) -> Self {
        CoreError::validation("document", err.to_string())
    }
}
