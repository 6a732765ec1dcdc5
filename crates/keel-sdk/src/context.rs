// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-operation handle given to a running job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use keel_core::protocol::HeartbeatAck;
use keel_core::{
    CheckpointInfo, CheckpointTracker, CheckpointType, Document, ExecutionObserver, LoadedCheckpoint,
    OperationStatus, PhaseTimer,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::BackendClient;
use crate::error::{Result, SdkError};
use crate::reconnect::RegistrationSignal;

#[derive(Debug, Clone, Default)]
pub(crate) struct ProgressReport {
    pub percent: Option<f64>,
    pub message: Option<String>,
}

/// State shared between a job, its heartbeat loop, and the worker.
pub(crate) struct JobShared {
    pub cancel: CancellationToken,
    pub published: Mutex<Option<Document>>,
    pub progress: Mutex<ProgressReport>,
    pub registration: Arc<RegistrationSignal>,
}

impl JobShared {
    pub fn new(registration: Arc<RegistrationSignal>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            published: Mutex::new(None),
            progress: Mutex::new(ProgressReport::default()),
            registration,
        }
    }
}

/// What the worker should do after a heartbeat acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckAction {
    Continue,
    /// The coordinator settled the operation; stop the job.
    Stop,
    /// The coordinator lost track of us; re-register to reclaim.
    Reclaim,
}

pub(crate) fn ack_action(ack: &HeartbeatAck) -> AckAction {
    if ack.accepted {
        return AckAction::Continue;
    }
    match ack.status {
        OperationStatus::PendingReconciliation => AckAction::Reclaim,
        // The coordinator records the start only after we accepted it.
        OperationStatus::Running | OperationStatus::Pending => AckAction::Continue,
        _ => AckAction::Stop,
    }
}

/// Handle given to a running [`JobHandler`](crate::JobHandler).
///
/// Cancellation is cooperative: the job should check
/// [`is_cancelled`](Self::is_cancelled) between units of work, or select on
/// [`cancellation_token`](Self::cancellation_token), and return promptly.
#[derive(Clone)]
pub struct OperationContext {
    operation_id: String,
    operation_type: String,
    metadata: Document,
    client: BackendClient,
    observer: Arc<dyn ExecutionObserver>,
    shared: Arc<JobShared>,
    tracker: Arc<Mutex<CheckpointTracker>>,
}

impl OperationContext {
    pub(crate) fn new(
        operation_id: String,
        operation_type: String,
        metadata: Document,
        client: BackendClient,
        observer: Arc<dyn ExecutionObserver>,
        shared: Arc<JobShared>,
        tracker: CheckpointTracker,
    ) -> Self {
        Self {
            operation_id,
            operation_type,
            metadata,
            client,
            observer,
            shared,
            tracker: Arc::new(Mutex::new(tracker)),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    pub fn metadata(&self) -> &Document {
        &self.metadata
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// `Err(SdkError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SdkError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Remember progress; sent with the next heartbeat.
    pub async fn report_progress(&self, percent: f64, message: impl Into<String>) {
        let mut progress = self.shared.progress.lock().await;
        progress.percent = Some(percent.clamp(0.0, 100.0));
        progress.message = Some(message.into());
    }

    /// Send a heartbeat now instead of waiting for the background loop.
    ///
    /// Trips the cancellation token when the coordinator reports the
    /// operation is no longer running.
    pub async fn heartbeat(&self) -> Result<()> {
        let progress = self.shared.progress.lock().await.clone();
        let ack = self
            .client
            .heartbeat(&self.operation_id, progress.percent, progress.message)
            .await?;
        apply_ack(&self.operation_id, &self.shared, &ack);
        Ok(())
    }

    /// Remember `state` as the latest resumable state.
    ///
    /// This is what a shutdown checkpoint captures.
    pub async fn publish_state(&self, state: Document) {
        *self.shared.published.lock().await = Some(state);
    }

    /// Publish `state` and save a periodic checkpoint when the policy says one is due.
    ///
    /// `units` is the job's own progress counter (epochs, bars, rows).
    pub async fn checkpoint_if_due(&self, units: u64, state: &Document) -> Result<bool> {
        self.publish_state(state.clone()).await;
        let mut tracker = self.tracker.lock().await;
        let now = Instant::now();
        if !tracker.is_due(now, units) {
            return Ok(false);
        }
        self.client
            .save_checkpoint(&self.operation_id, CheckpointType::Periodic, state, None)
            .await?;
        tracker.mark(now, units);
        debug!(operation_id = %self.operation_id, units, "Periodic checkpoint saved");
        Ok(true)
    }

    /// Save a checkpoint now, with optional artifact files.
    pub async fn checkpoint(
        &self,
        state: &Document,
        artifacts: Option<&BTreeMap<String, Vec<u8>>>,
    ) -> Result<CheckpointInfo> {
        self.publish_state(state.clone()).await;
        let info = self
            .client
            .save_checkpoint(&self.operation_id, CheckpointType::Manual, state, artifacts)
            .await?;
        Ok(info)
    }

    /// The checkpoint to resume from, if any.
    pub async fn load_checkpoint(&self, load_artifacts: bool) -> Result<Option<LoadedCheckpoint>> {
        self.client
            .load_checkpoint(&self.operation_id, load_artifacts)
            .await
    }

    pub fn observer(&self) -> Arc<dyn ExecutionObserver> {
        self.observer.clone()
    }

    /// Time a named phase; reported when the returned timer drops.
    pub fn phase(&self, name: &str) -> PhaseTimer {
        PhaseTimer::start(self.observer.clone(), &self.operation_id, name)
    }

    pub fn gate(&self, name: &str, passed: bool) {
        self.observer.gate_evaluated(&self.operation_id, name, passed);
    }
}

pub(crate) fn apply_ack(operation_id: &str, shared: &JobShared, ack: &HeartbeatAck) -> AckAction {
    let action = ack_action(ack);
    match action {
        AckAction::Continue => {}
        AckAction::Stop => {
            if !shared.cancel.is_cancelled() {
                info!(
                    operation_id = %operation_id,
                    status = %ack.status,
                    "Coordinator settled the operation, stopping job"
                );
                shared.cancel.cancel();
            }
        }
        AckAction::Reclaim => {
            warn!(operation_id = %operation_id, "Operation awaiting reconciliation, re-registering");
            shared.registration.request();
        }
    }
    action
}
