// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Graceful worker shutdown.
//!
//! Order: refuse new starts, save a `shutdown` checkpoint of the running
//! operation's last published state, cancel it through the coordinator, then
//! stop the job. Everything after refusing starts is bounded by the grace
//! period.

use std::time::Instant;

use keel_core::CheckpointType;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::worker::Worker;

/// Cancellation reason recorded on operations stopped by a worker shutdown.
pub const WORKER_SHUTDOWN_REASON: &str = "worker shutdown";

/// What a worker shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerDrainReport {
    pub checkpointed: Vec<String>,
    pub cancelled: Vec<String>,
    pub timed_out: Vec<String>,
    /// Outcomes never acknowledged by the coordinator; lost with this process.
    pub unreported: Vec<String>,
}

/// Drain the worker's slot within the configured grace period.
pub async fn drain(worker: &Worker) -> WorkerDrainReport {
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + worker.config().shutdown_grace();
    worker.begin_shutdown();

    let mut report = WorkerDrainReport::default();
    if let Some(job) = worker.take_running().await {
        let operation_id = job.operation_id.clone();
        let settle = async {
            let state = job.shared.published.lock().await.clone();
            if let Some(state) = state {
                match worker
                    .client()
                    .save_checkpoint(&operation_id, CheckpointType::Shutdown, &state, None)
                    .await
                {
                    Ok(_) => report.checkpointed.push(operation_id.clone()),
                    Err(e) => {
                        warn!(operation_id = %operation_id, error = %e, "Failed to save shutdown checkpoint")
                    }
                }
            }
            match worker.client().cancel(&operation_id, WORKER_SHUTDOWN_REASON).await {
                Ok(()) => report.cancelled.push(operation_id.clone()),
                Err(e) => debug!(operation_id = %operation_id, error = %e, "Operation not cancelled"),
            }
        };
        if tokio::time::timeout_at(deadline, settle).await.is_err() {
            warn!(operation_id = %operation_id, "Grace period expired while draining");
            report.timed_out.push(operation_id.clone());
        }

        job.shared.cancel.cancel();
        if tokio::time::timeout_at(deadline, job.handle).await.is_err() {
            debug!(operation_id = %operation_id, "Job still running after grace period");
        }
    }

    report.unreported = worker
        .pending_reports()
        .await
        .into_iter()
        .map(|r| r.operation_id)
        .collect();
    if !report.unreported.is_empty() {
        warn!(
            operations = ?report.unreported,
            "Exiting with outcomes the coordinator never acknowledged"
        );
    }

    info!(
        checkpointed = report.checkpointed.len(),
        cancelled = report.cancelled.len(),
        timed_out = report.timed_out.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Worker drained"
    );
    report
}
