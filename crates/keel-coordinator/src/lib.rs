// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Coordinator - Worker Registry, Reconciliation and Dispatch
//!
//! The coordinator is the single authority on operation status. Remote
//! workers register with it, receive operations, heartbeat, checkpoint and
//! report outcomes; when either side restarts, registration reconciles what
//! the worker reports against what the registry recorded.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Callers / UI                               │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                  │ HTTP /api/v1
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    keel-coordinator (This Crate)                      │
//! │  ┌────────────┐  ┌────────────────┐  ┌────────────┐  ┌─────────────┐  │
//! │  │   Worker   │  │ Reconciliation │  │ Dispatcher │  │    Local    │  │
//! │  │  Registry  │  │     Engine     │  │            │  │  Executor   │  │
//! │  └────────────┘  └────────────────┘  └────────────┘  └─────────────┘  │
//! │  ┌──────────────────────┐  ┌─────────────────────┐                    │
//! │  │  Heartbeat Monitor   │  │ Checkpoint Cleanup  │                    │
//! │  └──────────────────────┘  └─────────────────────┘                    │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │ keel-core                          │ start / cancel / health
//!        ▼                                    ▼
//! ┌───────────────────────┐        ┌──────────────────────────────────┐
//! │ SQLite or PostgreSQL  │        │  Workers (keel-sdk endpoints)    │
//! └───────────────────────┘        └──────────────────────────────────┘
//! ```
//!
//! # HTTP API
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `POST` | `/api/v1/operations` | Create an operation |
//! | `GET` | `/api/v1/operations` | List operations |
//! | `GET` | `/api/v1/operations/{id}` | Get an operation |
//! | `POST` | `/api/v1/operations/{id}/cancel` | Cancel, cascading to children |
//! | `POST` | `/api/v1/operations/{id}/dispatch` | Assign to an idle worker |
//! | `POST` | `/api/v1/operations/{id}/heartbeat` | Record progress |
//! | `POST` | `/api/v1/operations/{id}/complete` | Complete with a result |
//! | `POST` | `/api/v1/operations/{id}/fail` | Fail with an error |
//! | `PUT` | `/api/v1/operations/{id}/checkpoint` | Save the checkpoint |
//! | `GET` | `/api/v1/operations/{id}/checkpoint` | Load the checkpoint |
//! | `POST` | `/api/v1/workers/register` | Register and reconcile |
//! | `GET` | `/api/v1/workers` | List workers |
//!
//! # Background workers
//!
//! - [`heartbeat_monitor`]: probes workers, demotes stale operations, fails orphans
//! - [`checkpoint_cleanup_worker`]: expires old checkpoints and watches disk usage

pub mod checkpoint_cleanup_worker;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod heartbeat_monitor;
pub mod local_executor;
pub mod reconciliation;
pub mod runtime;
pub mod server;
pub mod shutdown;
pub mod worker_registry;

pub use context::{CoordinatorContext, CoordinatorSettings};
pub use error::{Error, Result};
pub use runtime::CoordinatorRuntime;
