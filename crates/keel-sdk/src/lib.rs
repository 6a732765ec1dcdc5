// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel SDK - Worker-Side Collaborator
//!
//! This crate turns a process into a keel worker: it serves the endpoints
//! the coordinator calls, runs one dispatched operation at a time, sends
//! heartbeats, saves checkpoints, and re-registers whenever the coordinator
//! may have lost track of it.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use keel_core::Document;
//! use keel_sdk::{JobHandler, OperationContext, SdkConfig, WorkerRuntime};
//!
//! struct TrainModel;
//!
//! #[async_trait]
//! impl JobHandler for TrainModel {
//!     async fn run(&self, ctx: OperationContext) -> Result<Option<Document>, String> {
//!         let resume = ctx.load_checkpoint(false).await.map_err(|e| e.to_string())?;
//!         for epoch in start_epoch(resume)..100 {
//!             if ctx.is_cancelled() {
//!                 return Ok(None);
//!             }
//!             let state = train_epoch(epoch).await?;
//!             ctx.report_progress(epoch as f64, format!("epoch {}", epoch)).await;
//!             ctx.checkpoint_if_due(epoch, &state).await.map_err(|e| e.to_string())?;
//!         }
//!         Ok(Some(final_metrics()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = WorkerRuntime::builder()
//!         .config(SdkConfig::from_env()?)
//!         .handler("training", Arc::new(TrainModel))
//!         .build()?
//!         .start()
//!         .await?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Worker endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `GET` | `/health` | Liveness and the running operation |
//! | `POST` | `/operations/start` | Start a dispatched operation (409 when busy) |
//! | `POST` | `/operations/{id}/cancel` | Trip the job's cancellation token |
//! | `POST` | `/shutdown-notice` | Coordinator is going away |
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `KEEL_WORKER_ID` | Yes | - | Stable worker identifier |
//! | `KEEL_WORKER_TYPE` | Yes | - | Operation type this worker serves |
//! | `KEEL_BACKEND_URL` | Yes | - | Coordinator base URL |
//! | `KEEL_WORKER_ENDPOINT_URL` | No | `http://{bound addr}` | URL advertised to the coordinator |
//! | `KEEL_WORKER_BIND_ADDR` | No | `0.0.0.0:9000` | Listen address |
//! | `KEEL_HEARTBEAT_INTERVAL_MS` | No | `5000` | Heartbeat interval |
//! | `KEEL_REQUEST_TIMEOUT_MS` | No | `10000` | Per-request timeout |
//! | `KEEL_MAX_RETRIES` | No | `3` | Retries per coordinator call |
//! | `KEEL_REREGISTER_INTERVAL_MS` | No | `30000` | Periodic re-registration |
//! | `KEEL_BACKEND_POLL_INTERVAL_MS` | No | `1000` | Poll while the coordinator is away |
//! | `KEEL_WORKER_SHUTDOWN_GRACE_MS` | No | `25000` | Shutdown budget |

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod reconnect;
pub mod runtime;
pub mod server;
pub mod shutdown;
pub mod worker;

pub use client::BackendClient;
pub use config::SdkConfig;
pub use context::OperationContext;
pub use error::{Result, SdkError};
pub use reconnect::{ReconnectLoop, RegistrationSignal};
pub use runtime::{WorkerRuntime, WorkerRuntimeBuilder};
pub use shutdown::{WORKER_SHUTDOWN_REASON, WorkerDrainReport};
pub use worker::{JobHandler, Worker};
