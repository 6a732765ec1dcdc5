// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor for backend-local operations.
//!
//! Operations created with `is_backend_local` run inside the coordinator
//! process as tokio tasks. Jobs follow the same contract as remote workers:
//! heartbeat, checkpoint when the policy says so, poll the cancellation token
//! between units of work, and publish their latest resumable state so a
//! shutdown can checkpoint it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel_core::error::CoreError;
use keel_core::{
    CheckpointTracker, CheckpointType, Document, ExecutionObserver, LoadedCheckpoint, Operation,
    OperationStatus, OperationType, PhaseTimer, Progress,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::CoordinatorContext;
use crate::error::{Error, Result};

/// A job the coordinator can execute itself.
///
/// `run` should return promptly once the context's cancellation token
/// fires; the operation's status has already been settled by then and the
/// return value is ignored.
#[async_trait]
pub trait LocalJob: Send + Sync {
    async fn run(&self, ctx: LocalJobContext) -> std::result::Result<Option<Document>, String>;
}

/// Handle given to a running [`LocalJob`].
#[derive(Clone)]
pub struct LocalJobContext {
    operation: Operation,
    ctx: Arc<CoordinatorContext>,
    cancel: CancellationToken,
    published: Arc<Mutex<Option<Document>>>,
    tracker: Arc<Mutex<CheckpointTracker>>,
}

impl LocalJobContext {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn operation_id(&self) -> &str {
        &self.operation.operation_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record progress. Trips the cancellation token if the operation is no
    /// longer running.
    pub async fn heartbeat(&self, progress: Progress) -> std::result::Result<(), CoreError> {
        match self
            .ctx
            .operations
            .record_heartbeat(self.operation_id(), None, progress)
            .await
        {
            Ok(_) => Ok(()),
            Err(e @ CoreError::InvalidOperationState { .. }) => {
                self.cancel.cancel();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Remember `state` as the latest resumable state.
    pub async fn publish_state(&self, state: Document) {
        *self.published.lock().await = Some(state);
    }

    /// Publish `state` and save a periodic checkpoint when the policy says one is due.
    pub async fn checkpoint_if_due(&self, units: u64, state: &Document) -> std::result::Result<bool, CoreError> {
        self.publish_state(state.clone()).await;
        let mut tracker = self.tracker.lock().await;
        let now = Instant::now();
        if !tracker.is_due(now, units) {
            return Ok(false);
        }
        self.ctx
            .checkpoints
            .save_checkpoint(self.operation_id(), CheckpointType::Periodic, state, None)
            .await?;
        tracker.mark(now, units);
        Ok(true)
    }

    /// The checkpoint to resume from, if any.
    pub async fn load_checkpoint(&self) -> std::result::Result<Option<LoadedCheckpoint>, CoreError> {
        self.ctx
            .checkpoints
            .load_checkpoint(self.operation_id(), true)
            .await
    }

    pub fn observer(&self) -> Arc<dyn ExecutionObserver> {
        self.ctx.observer.clone()
    }

    /// Time a named phase; reported when the returned timer drops.
    pub fn phase(&self, name: &str) -> PhaseTimer {
        PhaseTimer::start(self.ctx.observer.clone(), self.operation_id(), name)
    }

    pub fn gate(&self, name: &str, passed: bool) {
        self.ctx.observer.gate_evaluated(self.operation_id(), name, passed);
    }
}

struct RunningLocal {
    cancel: CancellationToken,
    published: Arc<Mutex<Option<Document>>>,
    handle: JoinHandle<()>,
}

/// What a drain did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub checkpointed: Vec<String>,
    pub cancelled: Vec<String>,
    /// Still in flight when the grace period ran out.
    pub timed_out: Vec<String>,
}

/// Runs backend-local operations.
pub struct LocalExecutor {
    ctx: Arc<CoordinatorContext>,
    jobs: HashMap<String, Arc<dyn LocalJob>>,
    running: Arc<Mutex<HashMap<String, RunningLocal>>>,
}

impl LocalExecutor {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self {
            ctx,
            jobs: HashMap::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register the job that runs operations of `operation_type`.
    pub fn with_job(mut self, operation_type: impl Into<String>, job: Arc<dyn LocalJob>) -> Self {
        self.jobs.insert(operation_type.into(), job);
        self
    }

    pub fn supports(&self, operation_type: &str) -> bool {
        self.jobs.contains_key(operation_type)
    }

    /// Ids of operations currently executing here.
    pub async fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a `pending` backend-local operation.
    pub async fn start(&self, operation_id: &str) -> Result<Operation> {
        if self.ctx.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let op = self.ctx.operations.get(operation_id).await?;
        if !op.is_backend_local {
            return Err(Error::InvalidRequest(format!(
                "operation '{}' is not backend-local",
                operation_id
            )));
        }
        let job = self.jobs.get(&op.operation_type).cloned().ok_or_else(|| {
            Error::InvalidRequest(format!(
                "no local job registered for operation type '{}'",
                op.operation_type
            ))
        })?;

        let op = self.ctx.operations.start(operation_id, None).await?;
        let operation_type = OperationType::new(op.operation_type.clone())
            .map_err(|e| Error::Other(e.to_string()))?;

        let cancel = CancellationToken::new();
        let published = Arc::new(Mutex::new(None));
        let policy = self
            .ctx
            .checkpoints
            .policies()
            .for_type(&op.operation_type)
            .clone();
        let job_ctx = LocalJobContext {
            operation: op.clone(),
            ctx: self.ctx.clone(),
            cancel: cancel.clone(),
            published: published.clone(),
            tracker: Arc::new(Mutex::new(CheckpointTracker::new(policy, Instant::now()))),
        };

        // Hold the map lock across spawn so the task's own removal cannot run first.
        let mut running = self.running.lock().await;
        let handle = tokio::spawn(execute(
            self.ctx.clone(),
            self.running.clone(),
            job,
            job_ctx,
            operation_type,
        ));
        running.insert(
            operation_id.to_string(),
            RunningLocal {
                cancel,
                published,
                handle,
            },
        );

        info!(operation_id = %operation_id, operation_type = %op.operation_type, "Local operation started");
        Ok(op)
    }

    /// Trip the cancellation token of a local operation.
    pub async fn cancel(&self, operation_id: &str) -> bool {
        match self.running.lock().await.get(operation_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Checkpoint and cancel every in-flight local operation within `grace`.
    ///
    /// Each operation's last published state is saved as a `shutdown`
    /// checkpoint, then the operation is cancelled with `reason`. Whatever is
    /// left when `grace` runs out is left untouched.
    pub async fn drain(&self, grace: Duration, reason: &str) -> DrainReport {
        let deadline = tokio::time::Instant::now() + grace;
        let entries: Vec<(String, RunningLocal)> = self.running.lock().await.drain().collect();
        let mut report = DrainReport::default();
        let mut handles = Vec::new();

        for (operation_id, entry) in entries {
            if tokio::time::Instant::now() >= deadline {
                report.timed_out.push(operation_id);
                continue;
            }
            match tokio::time::timeout_at(deadline, self.drain_one(&operation_id, &entry, reason)).await {
                Ok((checkpointed, cancelled)) => {
                    if checkpointed {
                        report.checkpointed.push(operation_id.clone());
                    }
                    if cancelled {
                        report.cancelled.push(operation_id.clone());
                    }
                }
                Err(_) => {
                    warn!(operation_id = %operation_id, "Grace period expired while draining");
                    report.timed_out.push(operation_id.clone());
                }
            }
            handles.push((operation_id, entry.handle));
        }

        for (operation_id, handle) in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                debug!(operation_id = %operation_id, "Local job still running after grace period");
            }
        }

        info!(
            checkpointed = report.checkpointed.len(),
            cancelled = report.cancelled.len(),
            timed_out = report.timed_out.len(),
            "Local executions drained"
        );
        report
    }

    async fn drain_one(&self, operation_id: &str, entry: &RunningLocal, reason: &str) -> (bool, bool) {
        let mut checkpointed = false;
        let state = entry.published.lock().await.clone();
        if let Some(state) = state {
            match self
                .ctx
                .checkpoints
                .save_checkpoint(operation_id, CheckpointType::Shutdown, &state, None)
                .await
            {
                Ok(_) => checkpointed = true,
                Err(e) => warn!(operation_id = %operation_id, error = %e, "Failed to save shutdown checkpoint"),
            }
        }

        let cancelled = match self.ctx.operations.cancel(operation_id, reason).await {
            Ok(_) => true,
            Err(e) => {
                debug!(operation_id = %operation_id, error = %e, "Local operation not cancelled");
                false
            }
        };
        entry.cancel.cancel();
        (checkpointed, cancelled)
    }
}

async fn execute(
    ctx: Arc<CoordinatorContext>,
    running: Arc<Mutex<HashMap<String, RunningLocal>>>,
    job: Arc<dyn LocalJob>,
    job_ctx: LocalJobContext,
    operation_type: OperationType,
) {
    let operation_id = job_ctx.operation_id().to_string();
    let cancel = job_ctx.cancel.clone();
    let published = job_ctx.published.clone();
    let started = Instant::now();
    ctx.observer.cycle_started(&operation_id, &operation_type);

    let outcome = job.run(job_ctx).await;

    if !cancel.is_cancelled() {
        let settled = match outcome {
            Ok(result) => ctx.operations.complete(&operation_id, result).await,
            Err(message) => {
                let state = published.lock().await.clone();
                ctx.operations.fail(&operation_id, &message, state).await
            }
        };
        if let Err(e) = settled {
            warn!(operation_id = %operation_id, error = %e, "Failed to settle local operation");
        }
    }

    match ctx.operations.get(&operation_id).await {
        Ok(op) => ctx
            .observer
            .cycle_finished(&operation_id, op.status, started.elapsed()),
        Err(e) => error!(operation_id = %operation_id, error = %e, "Failed to reload local operation"),
    }

    running.lock().await.remove(&operation_id);
}
