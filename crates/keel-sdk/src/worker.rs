// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-side execution of dispatched operations.
//!
//! A worker runs at most one operation at a time. A start request that
//! arrives while the slot is taken is refused as busy, which the coordinator
//! turns into a retryable `WORKER_BUSY`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use keel_core::protocol::{
    AnomalyKind, CompletedOperationReport, RegisterWorkerRequest, RegisterWorkerResponse,
    ReportedStatus, StartOperationRequest, WorkerHealthResponse,
};
use keel_core::{
    CheckpointTracker, Document, ExecutionObserver, OperationStatus, OperationType, TracingObserver,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::BackendClient;
use crate::config::SdkConfig;
use crate::context::{AckAction, JobShared, OperationContext, apply_ack};
use crate::error::{Result, SdkError};
use crate::reconnect::RegistrationSignal;

/// Job logic run by a worker.
///
/// `run` should poll [`OperationContext::is_cancelled`] between units of
/// work and return promptly once it is set; the operation's status has
/// already been settled by then and the return value is ignored.
/// `Err(message)` fails the operation, keeping the last published state as
/// its `failure` checkpoint.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: OperationContext) -> std::result::Result<Option<Document>, String>;
}

pub(crate) struct RunningJob {
    pub operation_id: String,
    pub shared: Arc<JobShared>,
    pub handle: JoinHandle<()>,
}

/// A worker process's view of its single execution slot.
pub struct Worker {
    config: SdkConfig,
    endpoint_url: String,
    client: BackendClient,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    observer: Arc<dyn ExecutionObserver>,
    slot: Arc<Mutex<Option<RunningJob>>>,
    /// Outcomes the coordinator has not acknowledged yet.
    outbox: Arc<Mutex<Vec<CompletedOperationReport>>>,
    registration: Arc<RegistrationSignal>,
    shutting_down: CancellationToken,
}

impl Worker {
    pub fn new(config: SdkConfig, endpoint_url: impl Into<String>) -> Result<Self> {
        let client = BackendClient::new(&config)?;
        Ok(Self {
            config,
            endpoint_url: endpoint_url.into(),
            client,
            handlers: HashMap::new(),
            observer: Arc::new(TracingObserver),
            slot: Arc::new(Mutex::new(None)),
            outbox: Arc::new(Mutex::new(Vec::new())),
            registration: Arc::new(RegistrationSignal::new()),
            shutting_down: CancellationToken::new(),
        })
    }

    /// Run `handler` for operations of `operation_type`.
    pub fn with_handler(mut self, operation_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(operation_type.into(), handler);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn client(&self) -> &BackendClient {
        &self.client
    }

    pub fn registration(&self) -> &Arc<RegistrationSignal> {
        &self.registration
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.is_cancelled()
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.cancel();
    }

    pub(crate) async fn take_running(&self) -> Option<RunningJob> {
        self.slot.lock().await.take()
    }

    pub async fn current_operation_id(&self) -> Option<String> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|job| job.operation_id.clone())
    }

    /// Outcomes waiting to be reported on the next registration.
    pub async fn pending_reports(&self) -> Vec<CompletedOperationReport> {
        self.outbox.lock().await.clone()
    }

    pub async fn health(&self) -> WorkerHealthResponse {
        WorkerHealthResponse {
            worker_id: self.config.worker_id.clone(),
            status: if self.is_shutting_down() {
                "shutting_down".to_string()
            } else {
                "ok".to_string()
            },
            current_operation_id: self.current_operation_id().await,
        }
    }

    /// Start a dispatched operation in the slot.
    ///
    /// A repeated start for the operation already running is accepted, so a
    /// coordinator retry after a lost answer does not look busy.
    pub async fn start_operation(self: &Arc<Self>, request: StartOperationRequest) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SdkError::ShuttingDown);
        }
        let operation_type = OperationType::new(request.operation_type.clone())
            .map_err(|e| SdkError::UnsupportedOperation(e.to_string()))?;
        let handler = self
            .handlers
            .get(operation_type.as_str())
            .cloned()
            .ok_or_else(|| SdkError::UnsupportedOperation(request.operation_type.clone()))?;

        // Hold the slot across spawn so the job's own removal cannot run first.
        let mut slot = self.slot.lock().await;
        if let Some(running) = slot.as_ref() {
            if running.operation_id == request.operation_id {
                debug!(operation_id = %request.operation_id, "Start repeated for running operation");
                return Ok(());
            }
            return Err(SdkError::Busy(running.operation_id.clone()));
        }

        let shared = Arc::new(JobShared::new(self.registration.clone()));
        let policy = self
            .config
            .checkpoint_policies
            .for_type(operation_type.as_str())
            .clone();
        let ctx = OperationContext::new(
            request.operation_id.clone(),
            request.operation_type.clone(),
            request.metadata,
            self.client.clone(),
            self.observer.clone(),
            shared.clone(),
            CheckpointTracker::new(policy, Instant::now()),
        );

        let handle = tokio::spawn(execute(self.clone(), handler, ctx, shared.clone(), operation_type));
        *slot = Some(RunningJob {
            operation_id: request.operation_id.clone(),
            shared,
            handle,
        });

        info!(
            operation_id = %request.operation_id,
            operation_type = %request.operation_type,
            "Operation started"
        );
        Ok(())
    }

    /// Trip the cancellation token of the running operation if it is `operation_id`.
    pub async fn cancel_operation(&self, operation_id: &str, reason: &str) -> bool {
        match self.slot.lock().await.as_ref() {
            Some(job) if job.operation_id == operation_id => {
                info!(operation_id = %operation_id, reason = %reason, "Cancellation requested");
                job.shared.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Register with the coordinator, reporting the running operation and
    /// any outcomes it has not acknowledged.
    pub async fn register(&self) -> Result<RegisterWorkerResponse> {
        let current_operation_id = self.current_operation_id().await;
        let completed = self.outbox.lock().await.clone();
        let request = RegisterWorkerRequest {
            worker_id: self.config.worker_id.clone(),
            worker_type: self.config.worker_type.clone(),
            endpoint_url: self.endpoint_url.clone(),
            current_operation_id: current_operation_id.clone(),
            completed_operations: completed.clone(),
        };

        self.registration.clear();
        let response = match self.client.register(&request).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_unreachable() {
                    self.registration.request();
                }
                return Err(e);
            }
        };

        // Every reported outcome got an answer: applied, already applied, or an anomaly.
        if !completed.is_empty() {
            let reported: Vec<&str> = completed.iter().map(|r| r.operation_id.as_str()).collect();
            self.outbox
                .lock()
                .await
                .retain(|r| !reported.contains(&r.operation_id.as_str()));
        }

        let report = &response.reconciliation;
        if let Some(current) = current_operation_id.as_deref() {
            let rejected = report
                .claim_rejected
                .as_ref()
                .is_some_and(|r| r.operation_id == current);
            let stale = report
                .anomalies
                .iter()
                .any(|a| a.operation_id == current && a.kind != AnomalyKind::ForeignOwner);
            if rejected || stale {
                warn!(
                    operation_id = %current,
                    claim_rejected = rejected,
                    "Coordinator does not recognise our operation, stopping job"
                );
                self.cancel_operation(current, "claim not accepted").await;
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            reclaimed = ?report.reclaimed,
            applied = report.applied.len(),
            anomalies = report.anomalies.len(),
            "Registered with coordinator"
        );
        Ok(response)
    }

    async fn settle(
        &self,
        operation_id: &str,
        outcome: std::result::Result<Option<Document>, String>,
        state: Option<Document>,
    ) -> OperationStatus {
        let (status, sent) = match &outcome {
            Ok(result) => (
                OperationStatus::Completed,
                self.client.complete(operation_id, result.clone()).await,
            ),
            Err(message) => (
                OperationStatus::Failed,
                self.client.fail(operation_id, message, state).await,
            ),
        };

        match sent {
            Ok(_) => {
                info!(operation_id = %operation_id, status = %status, "Outcome reported");
            }
            Err(e) if e.is_unreachable() || defers_to_reconciliation(&e) => {
                warn!(
                    operation_id = %operation_id,
                    status = %status,
                    error = %e,
                    "Outcome not applied, kept for re-registration"
                );
                let (reported, result, error_message) = match outcome {
                    Ok(result) => (ReportedStatus::Completed, result, None),
                    Err(message) => (ReportedStatus::Failed, None, Some(message)),
                };
                self.outbox.lock().await.push(CompletedOperationReport {
                    operation_id: operation_id.to_string(),
                    status: reported,
                    result,
                    error_message,
                    completed_at: Some(Utc::now()),
                });
                self.registration.request();
            }
            Err(e) => {
                // Settled elsewhere, e.g. cancelled or orphaned meanwhile.
                warn!(operation_id = %operation_id, error = %e, "Outcome rejected by coordinator");
            }
        }
        status
    }
}

/// The coordinator may not have recorded the start yet; reconciliation
/// applies an outcome from `pending` as well.
fn defers_to_reconciliation(err: &SdkError) -> bool {
    matches!(err.code(), Some("INVALID_TRANSITION" | "INVALID_OPERATION_STATE"))
}

async fn execute(
    worker: Arc<Worker>,
    handler: Arc<dyn JobHandler>,
    ctx: OperationContext,
    shared: Arc<JobShared>,
    operation_type: OperationType,
) {
    let operation_id = ctx.operation_id().to_string();
    let started = Instant::now();
    worker.observer.cycle_started(&operation_id, &operation_type);

    let heartbeat_stop = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        worker.client.clone(),
        operation_id.clone(),
        shared.clone(),
        worker.config.heartbeat_interval(),
        heartbeat_stop.clone(),
    ));

    let outcome = handler.run(ctx).await;

    heartbeat_stop.cancel();
    if let Err(e) = heartbeat.await {
        error!(operation_id = %operation_id, error = %e, "Heartbeat task panicked");
    }

    let status = if shared.cancel.is_cancelled() {
        debug!(operation_id = %operation_id, "Job stopped after cancellation");
        OperationStatus::Cancelled
    } else {
        let state = shared.published.lock().await.clone();
        worker.settle(&operation_id, outcome, state).await
    };
    worker
        .observer
        .cycle_finished(&operation_id, status, started.elapsed());

    let mut slot = worker.slot.lock().await;
    if slot.as_ref().is_some_and(|job| job.operation_id == operation_id) {
        *slot = None;
    }
}

async fn heartbeat_loop(
    client: BackendClient,
    operation_id: String,
    shared: Arc<JobShared>,
    interval: Duration,
    stop: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,

            _ = tokio::time::sleep(interval) => {
                let progress = shared.progress.lock().await.clone();
                match client.heartbeat(&operation_id, progress.percent, progress.message).await {
                    Ok(ack) => {
                        if apply_ack(&operation_id, &shared, &ack) == AckAction::Stop {
                            break;
                        }
                    }
                    Err(e) if e.is_unreachable() => {
                        warn!(operation_id = %operation_id, error = %e, "Heartbeat failed, coordinator unreachable");
                        shared.registration.request();
                    }
                    Err(e) if e.code() == Some("OWNERSHIP_CONFLICT") => {
                        warn!(operation_id = %operation_id, error = %e, "Operation owned by another worker, stopping job");
                        shared.cancel.cancel();
                        break;
                    }
                    Err(e) => warn!(operation_id = %operation_id, error = %e, "Heartbeat rejected"),
                }
            }
        }
    }
}
