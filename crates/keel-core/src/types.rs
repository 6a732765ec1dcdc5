// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared domain types: statuses, operation types, and the validated JSON
//! `Document` used for metadata, results, and checkpoint state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum nesting depth accepted for a [`Document`].
pub const MAX_DOCUMENT_DEPTH: usize = 32;

/// Maximum serialized size accepted for a [`Document`] (16 MiB).
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// Maximum length of an operation type name.
pub const MAX_OPERATION_TYPE_LEN: usize = 64;

/// Error returned when a string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

// ============================================================================
// Operation status
// ============================================================================

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Created, not yet assigned.
    Pending,
    /// Owned by a worker (or the backend) and making progress.
    Running,
    /// Owner went silent; waiting for a worker to reclaim or for orphan expiry.
    PendingReconciliation,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl OperationStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [OperationStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::PendingReconciliation,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses counted as "active" by list filters.
    pub const ACTIVE: [OperationStatus; 3] =
        [Self::Pending, Self::Running, Self::PendingReconciliation];

    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PendingReconciliation => "pending_reconciliation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses have no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending, running, or awaiting reconciliation.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The fixed transition table.
    ///
    /// ```text
    /// pending                -> running
    /// running                -> pending_reconciliation | completed | failed | cancelled
    /// pending_reconciliation -> running | completed | failed | cancelled
    /// ```
    pub fn can_transition_to(&self, to: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, PendingReconciliation)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (PendingReconciliation, Running)
                | (PendingReconciliation, Completed)
                | (PendingReconciliation, Failed)
                | (PendingReconciliation, Cancelled)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "operation status",
                value: s.to_string(),
            })
    }
}

// ============================================================================
// Reconciliation status
// ============================================================================

/// Outcome of reconciling an operation whose owner went silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    /// Demoted, no worker has reclaimed it yet.
    Unreconciled,
    /// A worker reclaimed it or reported its outcome.
    Reconciled,
    /// Nobody reclaimed it within the grace period.
    Orphaned,
}

impl ReconciliationStatus {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreconciled => "unreconciled",
            Self::Reconciled => "reconciled",
            Self::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconciliationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unreconciled" => Ok(Self::Unreconciled),
            "reconciled" => Ok(Self::Reconciled),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(ParseEnumError {
                kind: "reconciliation status",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Checkpoint type
// ============================================================================

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Taken by the checkpoint policy during normal progress.
    Periodic,
    /// Taken while draining on a termination signal.
    Shutdown,
    /// Requested explicitly by the job or an operator.
    Manual,
    /// Snapshot saved right before the operation was marked failed.
    Failure,
}

impl CheckpointType {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Periodic => "periodic",
            Self::Shutdown => "shutdown",
            Self::Manual => "manual",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic" => Ok(Self::Periodic),
            "shutdown" => Ok(Self::Shutdown),
            "manual" => Ok(Self::Manual),
            "failure" => Ok(Self::Failure),
            other => Err(ParseEnumError {
                kind: "checkpoint type",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Operation type
// ============================================================================

/// Name of a kind of work, e.g. `training`.
///
/// The set is open: any non-empty name of at most 64 characters drawn from
/// `[a-z0-9_-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationType(String);

impl OperationType {
    /// Model training.
    pub const TRAINING: &'static str = "training";
    /// Strategy backtesting.
    pub const BACKTESTING: &'static str = "backtesting";
    /// Bulk data ingestion.
    pub const DATA_LOAD: &'static str = "data_load";
    /// Multi-phase autonomous research cycle.
    pub const RESEARCH_CYCLE: &'static str = "research_cycle";

    /// Validate and wrap an operation type name.
    pub fn new(name: impl Into<String>) -> Result<Self, ParseEnumError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_OPERATION_TYPE_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(name))
        } else {
            Err(ParseEnumError {
                kind: "operation type",
                value: name,
            })
        }
    }

    /// The type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OperationType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for OperationType {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OperationType> for String {
    fn from(value: OperationType) -> Self {
        value.0
    }
}

// ============================================================================
// Document
// ============================================================================

/// Reasons a JSON value is rejected as a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// The top-level value was not a JSON object.
    #[error("document must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    /// Nesting exceeded [`MAX_DOCUMENT_DEPTH`].
    #[error("document nesting depth {depth} exceeds maximum of {max}")]
    TooDeep {
        /// Measured depth.
        depth: usize,
        /// Allowed depth.
        max: usize,
    },
    /// Serialized form exceeded [`MAX_DOCUMENT_BYTES`].
    #[error("document size {size} bytes exceeds maximum of {max} bytes")]
    TooLarge {
        /// Serialized size in bytes.
        size: usize,
        /// Allowed size in bytes.
        max: usize,
    },
}

/// A caller-defined JSON object (metadata, result, checkpoint state).
///
/// Construction validates shape, depth, and size, so a `Document` held by the
/// core is always within limits.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Document(Map<String, Value>);

impl Document {
    /// An empty object.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Validate an arbitrary JSON value.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let map = match value {
            Value::Object(map) => map,
            other => return Err(DocumentError::NotAnObject(json_kind(&other))),
        };

        let depth = object_depth(&map);
        if depth > MAX_DOCUMENT_DEPTH {
            return Err(DocumentError::TooDeep {
                depth,
                max: MAX_DOCUMENT_DEPTH,
            });
        }

        let doc = Self(map);
        let size = doc.serialized_len();
        if size > MAX_DOCUMENT_BYTES {
            return Err(DocumentError::TooLarge {
                size,
                max: MAX_DOCUMENT_BYTES,
            });
        }
        Ok(doc)
    }

    /// Look up a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow the underlying object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub(crate) fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Whether the object has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length of the compact JSON encoding.
    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
    }

    /// Clone into a plain JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Convert into a plain JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for Document {
    type Error = DocumentError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn object_depth(map: &Map<String, Value>) -> usize {
    1 + map.values().map(value_depth).max().unwrap_or(0)
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => object_depth(map),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_table() {
        use OperationStatus::*;

        let allowed = [
            (Pending, Running),
            (Running, PendingReconciliation),
            (Running, Completed),
            (Running, Failed),
            (Running, Cancelled),
            (PendingReconciliation, Running),
            (PendingReconciliation, Completed),
            (PendingReconciliation, Failed),
            (PendingReconciliation, Cancelled),
        ];

        for from in OperationStatus::ALL {
            for to in OperationStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for from in OperationStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(
                OperationStatus::ALL
                    .into_iter()
                    .all(|to| !from.can_transition_to(to))
            );
        }
    }

    #[test]
    fn test_pending_reconciliation_only_from_running() {
        for from in OperationStatus::ALL {
            let reachable = from.can_transition_to(OperationStatus::PendingReconciliation);
            assert_eq!(reachable, from == OperationStatus::Running);
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in OperationStatus::ALL {
            assert_eq!(status.as_str().parse::<OperationStatus>(), Ok(status));
        }
        assert!("paused".parse::<OperationStatus>().is_err());
        assert_eq!(
            serde_json::to_value(OperationStatus::PendingReconciliation).unwrap(),
            json!("pending_reconciliation")
        );
    }

    #[test]
    fn test_operation_type_validation() {
        assert!(OperationType::new(OperationType::TRAINING).is_ok());
        assert!(OperationType::new("custom-etl_2").is_ok());
        assert!(OperationType::new("").is_err());
        assert!(OperationType::new("Training").is_err());
        assert!(OperationType::new("has space").is_err());
        assert!(OperationType::new("x".repeat(65)).is_err());
        assert!(OperationType::new("x".repeat(64)).is_ok());
    }

    #[test]
    fn test_document_accepts_objects_only() {
        assert!(Document::from_value(json!({"a": 1})).is_ok());
        assert_eq!(
            Document::from_value(json!([1, 2])),
            Err(DocumentError::NotAnObject("array"))
        );
        assert_eq!(
            Document::from_value(json!(null)),
            Err(DocumentError::NotAnObject("null"))
        );
    }

    #[test]
    fn test_document_depth_limit() {
        let mut value = json!({});
        for _ in 0..(MAX_DOCUMENT_DEPTH - 1) {
            value = json!({ "n": value });
        }
        assert!(Document::from_value(value.clone()).is_ok());

        let deeper = json!({ "n": value });
        assert!(matches!(
            Document::from_value(deeper),
            Err(DocumentError::TooDeep { .. })
        ));
    }

    #[test]
    fn test_document_size_limit() {
        let big = "x".repeat(MAX_DOCUMENT_BYTES);
        let result = Document::from_value(json!({ "blob": big }));
        assert!(matches!(result, Err(DocumentError::TooLarge { .. })));
    }

    #[test]
    fn test_document_serde_validates() {
        let doc: Document = serde_json::from_str(r#"{"epoch": 3}"#).unwrap();
        assert_eq!(doc.get("epoch"), Some(&json!(3)));
        assert!(serde_json::from_str::<Document>("[1]").is_err());
        assert_eq!(serde_json::to_string(&doc).unwrap(), r#"{"epoch":3}"#);
    }
}
