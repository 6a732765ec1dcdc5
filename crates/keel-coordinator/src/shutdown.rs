// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Graceful shutdown of the coordinator's in-flight work.
//!
//! Order: stop accepting registrations and dispatches, notify every known
//! worker, then drain backend-local executions within the grace period.
//! Stopping background workers and the HTTP server is left to the runtime.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use keel_core::protocol::ShutdownNotice;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::CoordinatorContext;
use crate::dispatcher::WorkerClient;
use crate::local_executor::{DrainReport, LocalExecutor};

/// Cancellation reason recorded on operations drained by a backend shutdown.
pub const BACKEND_SHUTDOWN_REASON: &str = "backend shutdown";

/// Upper bound on delivering shutdown notices; never more than the grace period.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub notified_workers: Vec<String>,
    pub unreachable_workers: Vec<String>,
    pub drain: DrainReport,
}

/// Drains the coordinator on a termination signal.
pub struct ShutdownCoordinator {
    ctx: Arc<CoordinatorContext>,
    client: Arc<dyn WorkerClient>,
    local: Arc<LocalExecutor>,
}

impl ShutdownCoordinator {
    pub fn new(
        ctx: Arc<CoordinatorContext>,
        client: Arc<dyn WorkerClient>,
        local: Arc<LocalExecutor>,
    ) -> Self {
        Self { ctx, client, local }
    }

    /// Run the shutdown sequence within the configured grace period.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let grace = self.ctx.settings.shutdown_grace;
        self.ctx.begin_shutdown();

        let mut report = ShutdownReport::default();
        self.notify_workers(NOTICE_TIMEOUT.min(grace), &mut report)
            .await;

        let remaining = grace.saturating_sub(started.elapsed());
        report.drain = self.local.drain(remaining, BACKEND_SHUTDOWN_REASON).await;

        info!(
            notified_workers = report.notified_workers.len(),
            unreachable_workers = report.unreachable_workers.len(),
            checkpointed = report.drain.checkpointed.len(),
            cancelled = report.drain.cancelled.len(),
            timed_out = report.drain.timed_out.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Coordinator shutdown drain finished"
        );
        report
    }

    async fn notify_workers(&self, budget: Duration, report: &mut ShutdownReport) {
        let workers = self.ctx.workers.list().await;
        if workers.is_empty() {
            return;
        }

        let notice = ShutdownNotice {
            reason: BACKEND_SHUTDOWN_REASON.to_string(),
            sent_at: Utc::now(),
        };

        let mut pending: HashSet<String> = workers.iter().map(|w| w.worker_id.clone()).collect();
        let mut notices = JoinSet::new();
        for worker in workers {
            let client = self.client.clone();
            let notice = notice.clone();
            notices.spawn(async move {
                let result = client.shutdown_notice(&worker.endpoint_url, &notice).await;
                (worker.worker_id, result)
            });
        }

        // Bounded even if a client ignores its own timeout.
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match tokio::time::timeout_at(deadline, notices.join_next()).await {
                Ok(Some(Ok((worker_id, Ok(()))))) => {
                    debug!(worker_id = %worker_id, "Shutdown notice delivered");
                    pending.remove(&worker_id);
                    report.notified_workers.push(worker_id);
                }
                Ok(Some(Ok((worker_id, Err(e))))) => {
                    warn!(worker_id = %worker_id, error = %e, "Failed to deliver shutdown notice");
                    pending.remove(&worker_id);
                    report.unreachable_workers.push(worker_id);
                }
                Ok(Some(Err(e))) => warn!(error = %e, "Shutdown notice task panicked"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        undelivered = pending.len(),
                        budget_ms = budget.as_millis() as u64,
                        "Timed out delivering shutdown notices"
                    );
                    notices.abort_all();
                    report.unreachable_workers.extend(pending.drain());
                    break;
                }
            }
        }
        report.notified_workers.sort();
        report.unreachable_workers.sort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoordinatorSettings;
    use crate::dispatcher::{StartOutcome, WorkerCallError};
    use crate::worker_registry::WorkerRegistration;
    use async_trait::async_trait;
    use keel_core::protocol::{StartOperationRequest, WorkerHealthResponse};
    use keel_core::{CheckpointPolicies, SqlitePersistence};

    /// Never answers a shutdown notice.
    struct Unresponsive;

    #[async_trait]
    impl WorkerClient for Unresponsive {
        async fn health(&self, _: &str) -> std::result::Result<WorkerHealthResponse, WorkerCallError> {
            std::future::pending().await
        }

        async fn start_operation(
            &self,
            _: &str,
            _: &StartOperationRequest,
        ) -> std::result::Result<StartOutcome, WorkerCallError> {
            std::future::pending().await
        }

        async fn cancel_operation(&self, _: &str, _: &str, _: &str) -> std::result::Result<(), WorkerCallError> {
            std::future::pending().await
        }

        async fn shutdown_notice(&self, _: &str, _: &ShutdownNotice) -> std::result::Result<(), WorkerCallError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_notices_bounded_by_short_grace() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SqlitePersistence::from_path(dir.path().join("keel.db"))
            .await
            .unwrap();
        let ctx = Arc::new(CoordinatorContext::new(
            Arc::new(persistence),
            CheckpointPolicies::default(),
            dir.path().join("checkpoints"),
            CoordinatorSettings {
                shutdown_grace: Duration::from_millis(200),
                ..CoordinatorSettings::default()
            },
        ));
        ctx.workers
            .register(WorkerRegistration {
                worker_id: "w1".to_string(),
                worker_type: "training".to_string(),
                endpoint_url: "http://w1:9000".to_string(),
            })
            .await;
        let local = Arc::new(LocalExecutor::new(ctx.clone()));

        let started = Instant::now();
        let report = ShutdownCoordinator::new(ctx.clone(), Arc::new(Unresponsive), local)
            .shutdown()
            .await;

        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert!(report.notified_workers.is_empty());
        assert_eq!(report.unreachable_workers, vec!["w1".to_string()]);
        assert!(ctx.is_shutting_down());
    }
}
