// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Core - Operation Lifecycle Engine
//!
//! This crate holds the durable half of keel: the operation state machine,
//! the single-slot checkpoint store, and the host-local exclusive lock. The
//! coordinator and the worker SDK build on it.
//!
//! # State machine
//!
//! ```text
//!   pending ──► running ──► completed | failed | cancelled
//!                 │  ▲
//!                 ▼  │
//!        pending_reconciliation ──► completed | failed | cancelled
//! ```
//!
//! Terminal states never change again. `pending_reconciliation` is only
//! entered from `running`, when the owner stopped heartbeating or became
//! unreachable, and is left when the owner re-registers or the orphan grace
//! period expires.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`operations`] | Operation registry and compare-and-set transitions |
//! | [`checkpoints`] | Checkpoint store, artifact publishing, checkpoint policy |
//! | [`lock`] | Exclusive execution lock backed by a pid marker file |
//! | [`persistence`] | `Persistence` trait with SQLite and PostgreSQL backends |
//! | [`protocol`] | JSON wire types shared by coordinator and workers |
//! | [`events`] | Execution observer extension point |

pub mod checkpoints;
pub mod error;
pub mod events;
pub mod lock;
pub mod migrations;
pub mod operations;
pub mod persistence;
pub mod protocol;
pub mod types;

pub use checkpoints::{
    ArtifactStore, CheckpointInfo, CheckpointPolicies, CheckpointPolicy, CheckpointStore,
    CheckpointTracker, LoadedCheckpoint,
};
pub use error::{CoreError, Result};
pub use events::{ExecutionObserver, PhaseTimer, TracingObserver};
pub use lock::{ExclusiveLock, LockError, LockGuard, ProcessLiveness};
pub use operations::{
    CancelOutcome, NewOperation, Operation, OperationFilter, OperationPage, OperationRegistry,
    Progress, Transition,
};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use types::{CheckpointType, Document, OperationStatus, OperationType, ReconciliationStatus};
