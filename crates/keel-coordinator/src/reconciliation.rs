// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation engine.
//!
//! Resolves the operation registry against what workers report when they
//! (re-)register:
//!
//! - a reported current operation that is `running` or
//!   `pending_reconciliation` is reclaimed by the reporting worker, unless a
//!   different live worker already owns it
//! - reported finished operations are applied if still non-terminal
//! - reports contradicting a terminal status are returned as anomalies and
//!   never change the row
//!
//! It also owns the two time-based paths: demoting operations whose owner
//! went quiet, and failing demoted operations nobody reclaimed in time.

use std::sync::Arc;

use keel_core::error::CoreError;
use keel_core::protocol::{
    Anomaly, AnomalyKind, AppliedOutcome, ClaimRejected, CompletedOperationReport,
    ReconciliationReport, ReportedStatus,
};
use keel_core::{Document, Operation, OperationStatus, Transition};
use tracing::{debug, info, warn};

use crate::context::CoordinatorContext;
use crate::error::Result;

/// Error message recorded on operations failed by orphan detection.
pub const ORPHANED_MESSAGE: &str = "worker did not reclaim operation";

/// Error message used when a worker reports failure without one.
const DEFAULT_FAILURE_MESSAGE: &str = "worker reported failure";

pub struct ReconciliationEngine {
    ctx: Arc<CoordinatorContext>,
}

impl ReconciliationEngine {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self { ctx }
    }

    /// Reconcile one registration.
    pub async fn reconcile(
        &self,
        worker_id: &str,
        current_operation_id: Option<&str>,
        completed: &[CompletedOperationReport],
    ) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        if let Some(operation_id) = current_operation_id {
            self.reconcile_current(worker_id, operation_id, &mut report)
                .await?;
        } else {
            self.ctx.workers.clear_slot(worker_id).await;
        }

        for outcome in completed {
            if current_operation_id == Some(outcome.operation_id.as_str()) {
                // Finishing the operation it also claims: the outcome wins.
                report.reclaimed = None;
            }
            self.apply_reported_outcome(worker_id, outcome, &mut report)
                .await?;
        }

        if !report.anomalies.is_empty() || report.claim_rejected.is_some() {
            warn!(
                worker_id = %worker_id,
                anomalies = report.anomalies.len(),
                claim_rejected = report.claim_rejected.is_some(),
                "Reconciliation found disagreements"
            );
        }
        info!(
            worker_id = %worker_id,
            reclaimed = ?report.reclaimed,
            applied = report.applied.len(),
            "Worker reconciled"
        );

        Ok(report)
    }

    async fn reconcile_current(
        &self,
        worker_id: &str,
        operation_id: &str,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let Some(op) = self.ctx.operations.find(operation_id).await? else {
            self.ctx.workers.clear_slot(worker_id).await;
            report.anomalies.push(anomaly(
                operation_id,
                AnomalyKind::UnknownOperation,
                None,
                "worker reports an operation that does not exist",
            ));
            return Ok(());
        };

        match op.status {
            status if status.is_terminal() => {
                self.ctx.workers.clear_slot(worker_id).await;
                warn!(
                    operation_id = %operation_id,
                    worker_id = %worker_id,
                    stored_status = %status,
                    "Worker reports a terminal operation as current"
                );
                report.anomalies.push(anomaly(
                    operation_id,
                    AnomalyKind::StaleReport,
                    Some(status),
                    format!("operation is already {}", status),
                ));
            }
            OperationStatus::Pending => {
                // The start request reached the worker but its acceptance never
                // reached us.
                self.ctx
                    .operations
                    .start(operation_id, Some(worker_id))
                    .await?;
                self.ctx.workers.assign(worker_id, operation_id).await;
                report.reclaimed = Some(operation_id.to_string());
            }
            _ => self.claim(worker_id, op, report).await?,
        }
        Ok(())
    }

    /// Claim a `running` or `pending_reconciliation` operation.
    async fn claim(&self, worker_id: &str, op: Operation, report: &mut ReconciliationReport) -> Result<()> {
        let operation_id = op.operation_id.as_str();

        if let Some(owner) = op.worker_id.as_deref()
            && owner != worker_id
            && self.ctx.workers.protects_claims(owner).await
        {
            warn!(
                operation_id = %operation_id,
                owner = %owner,
                claimant = %worker_id,
                "Claim rejected, operation owned by a live worker"
            );
            self.ctx.workers.clear_slot(worker_id).await;
            report.claim_rejected = Some(ClaimRejected {
                operation_id: operation_id.to_string(),
                owner: owner.to_string(),
            });
            return Ok(());
        }

        if self
            .ctx
            .operations
            .reclaim(operation_id, worker_id, op.worker_id.as_deref())
            .await?
        {
            self.ctx.workers.assign(worker_id, operation_id).await;
            report.reclaimed = Some(operation_id.to_string());
            return Ok(());
        }

        // Lost a race; report what won.
        self.ctx.workers.clear_slot(worker_id).await;
        let current = self.ctx.operations.get(operation_id).await?;
        if current.status.is_terminal() {
            report.anomalies.push(anomaly(
                operation_id,
                AnomalyKind::StaleReport,
                Some(current.status),
                format!("operation became {} during reclaim", current.status),
            ));
        } else {
            report.claim_rejected = Some(ClaimRejected {
                operation_id: operation_id.to_string(),
                owner: current.worker_id.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn apply_reported_outcome(
        &self,
        worker_id: &str,
        outcome: &CompletedOperationReport,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let operation_id = outcome.operation_id.as_str();
        let target = match outcome.status {
            ReportedStatus::Completed => OperationStatus::Completed,
            ReportedStatus::Failed => OperationStatus::Failed,
        };

        let Some(op) = self.ctx.operations.find(operation_id).await? else {
            report.anomalies.push(anomaly(
                operation_id,
                AnomalyKind::UnknownOperation,
                None,
                "reported outcome for an operation that does not exist",
            ));
            return Ok(());
        };

        if op.status.is_terminal() {
            if op.status != target {
                warn!(
                    operation_id = %operation_id,
                    worker_id = %worker_id,
                    stored_status = %op.status,
                    reported_status = %target,
                    "Reported outcome contradicts stored status"
                );
                report.anomalies.push(anomaly(
                    operation_id,
                    AnomalyKind::StaleReport,
                    Some(op.status),
                    format!("operation is already {}, worker reported {}", op.status, target),
                ));
            } else {
                debug!(operation_id = %operation_id, "Reported outcome already applied");
            }
            self.ctx.workers.release(worker_id, operation_id).await;
            return Ok(());
        }

        if let Some(owner) = op.worker_id.as_deref()
            && owner != worker_id
            && self.ctx.workers.protects_claims(owner).await
        {
            report.anomalies.push(anomaly(
                operation_id,
                AnomalyKind::ForeignOwner,
                Some(op.status),
                format!("operation is owned by live worker '{}'", owner),
            ));
            return Ok(());
        }

        match self.apply_outcome(worker_id, &op, target, outcome).await {
            Ok(applied) => {
                info!(
                    operation_id = %operation_id,
                    worker_id = %worker_id,
                    status = %applied.status,
                    "Applied reported outcome"
                );
                report.applied.push(AppliedOutcome {
                    operation_id: operation_id.to_string(),
                    status: applied.status,
                });
            }
            Err(CoreError::InvalidTransition { .. } | CoreError::InvalidOperationState { .. }) => {
                let current = self.ctx.operations.get(operation_id).await?;
                if current.status != target {
                    report.anomalies.push(anomaly(
                        operation_id,
                        AnomalyKind::StaleReport,
                        Some(current.status),
                        format!("operation became {} concurrently", current.status),
                    ));
                }
            }
            Err(e) => return Err(e.into()),
        }
        self.ctx.workers.clear_operation(operation_id).await;
        Ok(())
    }

    async fn apply_outcome(
        &self,
        worker_id: &str,
        op: &Operation,
        target: OperationStatus,
        outcome: &CompletedOperationReport,
    ) -> std::result::Result<Operation, CoreError> {
        let operation_id = op.operation_id.as_str();
        if op.status == OperationStatus::Pending {
            self.ctx
                .operations
                .start(operation_id, Some(worker_id))
                .await?;
        }

        match target {
            OperationStatus::Completed => {
                self.ctx
                    .operations
                    .complete_reported(operation_id, outcome.result.clone(), outcome.completed_at)
                    .await
            }
            _ => {
                let message = failure_message(outcome);
                self.ctx
                    .operations
                    .fail_reported(operation_id, &message, outcome.completed_at)
                    .await
            }
        }
    }

    /// Demote the running operations of a worker that stopped answering.
    pub async fn on_worker_lost(&self, worker_id: &str) -> Result<Vec<String>> {
        let mut demoted = Vec::new();
        for op in self.ctx.operations.active_for_worker(worker_id).await? {
            if op.status != OperationStatus::Running {
                continue;
            }
            match self
                .ctx
                .operations
                .transition(
                    &op.operation_id,
                    Transition::to(OperationStatus::PendingReconciliation)
                        .expecting_worker(Some(worker_id.to_string())),
                )
                .await
            {
                Ok(_) => {
                    warn!(
                        operation_id = %op.operation_id,
                        worker_id = %worker_id,
                        "Operation of lost worker moved to pending_reconciliation"
                    );
                    demoted.push(op.operation_id);
                }
                Err(
                    CoreError::InvalidTransition { .. }
                    | CoreError::InvalidOperationState { .. }
                    | CoreError::OwnershipConflict { .. },
                ) => {
                    debug!(operation_id = %op.operation_id, "Operation moved on before demotion");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(demoted)
    }

    /// Demote running operations with no sign of life within the staleness threshold.
    pub async fn sweep_stale(&self) -> Result<Vec<String>> {
        Ok(self
            .ctx
            .operations
            .demote_stale(self.ctx.staleness_threshold())
            .await?)
    }

    /// Fail demoted operations whose grace period expired.
    pub async fn detect_orphans(&self) -> Result<Vec<String>> {
        let failed = self
            .ctx
            .operations
            .fail_orphaned(self.ctx.orphan_grace(), ORPHANED_MESSAGE)
            .await?;
        for operation_id in &failed {
            self.ctx.workers.clear_operation(operation_id).await;
        }
        Ok(failed)
    }

    /// Startup sweep, run before the API accepts registrations.
    pub async fn startup_sweep(&self) -> Result<Vec<String>> {
        let demoted = self.sweep_stale().await?;
        info!(demoted = demoted.len(), "Startup sweep finished");
        Ok(demoted)
    }
}

fn failure_message(outcome: &CompletedOperationReport) -> String {
    if let Some(message) = outcome.error_message.as_deref()
        && !message.is_empty()
    {
        return message.to_string();
    }
    outcome
        .result
        .as_ref()
        .and_then(|r: &Document| r.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string())
}

fn anomaly(
    operation_id: &str,
    kind: AnomalyKind,
    stored_status: Option<OperationStatus>,
    message: impl Into<String>,
) -> Anomaly {
    Anomaly {
        operation_id: operation_id.to_string(),
        kind,
        stored_status,
        message: message.into(),
    }
}
