// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for worker liveness and stale-operation detection.
//!
//! Every tick:
//! 1. Probes each registered worker that is due (`GET {endpoint}/health`).
//!    A worker that was never probed is always due. After
//!    `max_missed_probes` consecutive failures the worker is unhealthy and
//!    its running operation is demoted to `pending_reconciliation`.
//! 2. Demotes `running` operations with no heartbeat within the staleness
//!    threshold (falling back to `started_at`, then `created_at`).
//! 3. Fails `pending_reconciliation` operations whose grace period expired.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::CoordinatorContext;
use crate::dispatcher::WorkerClient;
use crate::reconciliation::ReconciliationEngine;

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitorConfig {
    /// How often the monitor ticks; also the probe interval per worker.
    pub poll_interval: Duration,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// What one monitor tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorTick {
    pub probed: Vec<String>,
    pub lost_workers: Vec<String>,
    pub demoted: Vec<String>,
    pub orphaned: Vec<String>,
}

/// Background worker that probes workers and sweeps stale operations.
pub struct HeartbeatMonitor {
    ctx: Arc<CoordinatorContext>,
    reconciliation: Arc<ReconciliationEngine>,
    client: Arc<dyn WorkerClient>,
    config: HeartbeatMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HeartbeatMonitor {
    pub fn new(
        ctx: Arc<CoordinatorContext>,
        reconciliation: Arc<ReconciliationEngine>,
        client: Arc<dyn WorkerClient>,
        config: HeartbeatMonitorConfig,
    ) -> Self {
        Self {
            ctx,
            reconciliation,
            client,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            staleness_threshold_secs = self.ctx.settings.staleness_threshold.as_secs(),
            max_missed_probes = self.ctx.settings.max_missed_probes,
            orphan_grace_secs = self.ctx.settings.orphan_grace.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Heartbeat monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }

    /// Run one monitor pass.
    pub async fn tick(&self) -> MonitorTick {
        let mut tick = MonitorTick::default();

        self.probe_workers(&mut tick).await;

        match self.reconciliation.sweep_stale().await {
            Ok(demoted) => tick.demoted = demoted,
            Err(e) => error!(error = %e, "Failed to demote stale operations"),
        }

        match self.reconciliation.detect_orphans().await {
            Ok(orphaned) => tick.orphaned = orphaned,
            Err(e) => error!(error = %e, "Failed to fail orphaned operations"),
        }

        if tick.lost_workers.is_empty() && tick.demoted.is_empty() && tick.orphaned.is_empty() {
            debug!(probed = tick.probed.len(), "Heartbeat monitor tick clean");
        } else {
            info!(
                probed = tick.probed.len(),
                lost_workers = tick.lost_workers.len(),
                demoted = tick.demoted.len(),
                orphaned = tick.orphaned.len(),
                "Heartbeat monitor tick"
            );
        }
        tick
    }

    async fn probe_workers(&self, tick: &mut MonitorTick) {
        // Slack for timer jitter.
        let interval = self.ctx.health_check_interval() - chrono::Duration::milliseconds(500);
        let due = self.ctx.workers.due_for_probe(interval).await;
        if due.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for worker in due {
            let client = self.client.clone();
            probes.spawn(async move {
                let result = client.health(&worker.endpoint_url).await;
                (worker.worker_id, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (worker_id, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Health probe task panicked");
                    continue;
                }
            };
            tick.probed.push(worker_id.clone());

            match result {
                Ok(_) => self.ctx.workers.record_probe_success(&worker_id).await,
                Err(e) => {
                    debug!(worker_id = %worker_id, error = %e, "Health probe failed");
                    let Some(failure) = self
                        .ctx
                        .workers
                        .record_probe_failure(&worker_id, self.ctx.settings.max_missed_probes)
                        .await
                    else {
                        continue;
                    };
                    if failure.became_unhealthy {
                        tick.lost_workers.push(worker_id.clone());
                        match self.reconciliation.on_worker_lost(&worker_id).await {
                            Ok(demoted) => tick.demoted.extend(demoted),
                            Err(e) => warn!(
                                worker_id = %worker_id,
                                error = %e,
                                "Failed to demote operations of lost worker"
                            ),
                        }
                    }
                }
            }
        }
        tick.probed.sort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoordinatorSettings;
    use crate::dispatcher::{StartOutcome, WorkerCallError};
    use crate::worker_registry::{HealthStatus, WorkerRegistration};
    use async_trait::async_trait;
    use keel_core::protocol::{ShutdownNotice, StartOperationRequest, WorkerHealthResponse};
    use keel_core::{CheckpointPolicies, Document, OperationStatus, OperationType, SqlitePersistence};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Answers health probes unless the worker is switched off.
    #[derive(Default)]
    struct SwitchableClient {
        down: Mutex<bool>,
        probes: AtomicUsize,
    }

    impl SwitchableClient {
        fn set_down(&self, down: bool) {
            *self.down.lock().unwrap() = down;
        }
    }

    #[async_trait]
    impl WorkerClient for SwitchableClient {
        async fn health(&self, _: &str) -> std::result::Result<WorkerHealthResponse, WorkerCallError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if *self.down.lock().unwrap() {
                return Err(WorkerCallError::Transport {
                    attempts: 1,
                    details: "connection refused".to_string(),
                });
            }
            Ok(WorkerHealthResponse {
                worker_id: "w1".to_string(),
                status: "ok".to_string(),
                current_operation_id: None,
            })
        }

        async fn start_operation(
            &self,
            _: &str,
            _: &StartOperationRequest,
        ) -> std::result::Result<StartOutcome, WorkerCallError> {
            Ok(StartOutcome::Accepted)
        }

        async fn cancel_operation(&self, _: &str, _: &str, _: &str) -> std::result::Result<(), WorkerCallError> {
            Ok(())
        }

        async fn shutdown_notice(&self, _: &str, _: &ShutdownNotice) -> std::result::Result<(), WorkerCallError> {
            Ok(())
        }
    }

    /// A monitor whose every tick probes every worker.
    async fn setup(
        health_check_interval: Duration,
    ) -> (TempDir, Arc<CoordinatorContext>, Arc<SwitchableClient>, HeartbeatMonitor) {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SqlitePersistence::from_path(dir.path().join("keel.db"))
            .await
            .unwrap();
        let ctx = Arc::new(CoordinatorContext::new(
            Arc::new(persistence),
            CheckpointPolicies::default(),
            dir.path().join("checkpoints"),
            CoordinatorSettings {
                staleness_threshold: Duration::from_secs(60),
                health_check_interval,
                max_missed_probes: 3,
                orphan_grace: Duration::from_secs(60),
                shutdown_grace: Duration::from_secs(5),
            },
        ));
        ctx.workers
            .register(WorkerRegistration {
                worker_id: "w1".to_string(),
                worker_type: "training".to_string(),
                endpoint_url: "http://w1:9000".to_string(),
            })
            .await;
        let client = Arc::new(SwitchableClient::default());
        let monitor = HeartbeatMonitor::new(
            ctx.clone(),
            Arc::new(ReconciliationEngine::new(ctx.clone())),
            client.clone(),
            HeartbeatMonitorConfig {
                poll_interval: health_check_interval,
            },
        );
        (dir, ctx, client, monitor)
    }

    async fn running_on_w1(ctx: &CoordinatorContext) -> String {
        let id = ctx
            .operations
            .create(OperationType::new("training").unwrap(), Document::new())
            .await
            .unwrap();
        ctx.operations.start(&id, Some("w1")).await.unwrap();
        ctx.workers.assign("w1", &id).await;
        id
    }

    #[test]
    fn test_config_default() {
        let config = HeartbeatMonitorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_lost_after_max_missed_probes_and_demoted_once() {
        let (_dir, ctx, client, monitor) = setup(Duration::from_millis(500)).await;
        let id = running_on_w1(&ctx).await;
        client.set_down(true);

        for missed in 1..=2 {
            let tick = monitor.tick().await;
            assert_eq!(tick.probed, vec!["w1".to_string()]);
            assert!(tick.lost_workers.is_empty());
            assert!(tick.demoted.is_empty());
            let worker = ctx.workers.get("w1").await.unwrap();
            assert_eq!(worker.missed_probes, missed);
            assert_eq!(worker.health_status, HealthStatus::Unknown);
            assert_eq!(ctx.operations.get(&id).await.unwrap().status, OperationStatus::Running);
        }

        let tick = monitor.tick().await;
        assert_eq!(tick.lost_workers, vec!["w1".to_string()]);
        assert_eq!(tick.demoted, vec![id.clone()]);
        let op = ctx.operations.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::PendingReconciliation);
        let demoted_at = op.reconciliation_started_at;
        assert!(demoted_at.is_some());

        for _ in 0..2 {
            let tick = monitor.tick().await;
            assert_eq!(tick.probed, vec!["w1".to_string()]);
            assert!(tick.lost_workers.is_empty());
            assert!(tick.demoted.is_empty());
        }
        let op = ctx.operations.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::PendingReconciliation);
        assert_eq!(op.reconciliation_started_at, demoted_at);
        assert_eq!(
            ctx.workers.get("w1").await.unwrap().health_status,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_answered_probe_resets_missed_count() {
        let (_dir, ctx, client, monitor) = setup(Duration::from_millis(500)).await;
        let id = running_on_w1(&ctx).await;

        client.set_down(true);
        monitor.tick().await;
        monitor.tick().await;
        client.set_down(false);
        monitor.tick().await;
        let worker = ctx.workers.get("w1").await.unwrap();
        assert_eq!(worker.missed_probes, 0);
        assert_eq!(worker.health_status, HealthStatus::Healthy);

        client.set_down(true);
        for _ in 0..2 {
            assert!(monitor.tick().await.lost_workers.is_empty());
        }
        assert_eq!(ctx.operations.get(&id).await.unwrap().status, OperationStatus::Running);
    }

    #[tokio::test]
    async fn test_recently_probed_worker_is_not_due() {
        let (_dir, _ctx, client, monitor) = setup(Duration::from_secs(10)).await;

        // Never probed, so due at once.
        assert_eq!(monitor.tick().await.probed, vec!["w1".to_string()]);
        assert!(monitor.tick().await.probed.is_empty());
        assert_eq!(client.probes.load(Ordering::SeqCst), 1);
    }
}
