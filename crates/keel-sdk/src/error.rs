// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use keel_core::CoreError;
use thiserror::Error;

/// Errors that can occur in the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// The coordinator could not be reached after all retries
    #[error("transport failure after {attempts} attempts: {details}")]
    Transport { attempts: u32, details: String },

    /// The coordinator returned an error response
    #[error("server error: {code} - {message}")]
    Server {
        /// HTTP status of the response
        status: u16,
        /// Error code from the server
        code: String,
        /// Error message from the server
        message: String,
        /// Whether the server marked the failure as retryable
        retryable: bool,
    },

    /// This worker is already executing an operation
    #[error("worker busy with operation {0}")]
    Busy(String),

    /// The worker is shutting down
    #[error("worker shutting down")]
    ShuttingDown,

    /// No handler accepts the operation type
    #[error("unsupported operation type: {0}")]
    UnsupportedOperation(String),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Wire payload failed core validation
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Internal SDK error
    #[error("internal error: {0}")]
    Internal(String),
}

impl SdkError {
    /// True when the coordinator was unreachable or asked to be retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::Transport { .. } => true,
            SdkError::Server { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// True when the call never reached a coordinator able to answer it.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SdkError::Transport { .. })
            || matches!(self, SdkError::Server { code, .. } if code == "SHUTTING_DOWN")
    }

    /// Error code of a server-side failure.
    pub fn code(&self) -> Option<&str> {
        match self {
            SdkError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;
