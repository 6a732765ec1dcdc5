// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared coordinator state, built once at startup and handed to every
//! component.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    ArtifactStore, CheckpointPolicies, CheckpointStore, ExecutionObserver, OperationRegistry,
    Persistence, TracingObserver,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::worker_registry::WorkerRegistry;

/// Timing knobs shared by the monitor, reconciliation and shutdown paths.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub staleness_threshold: Duration,
    pub health_check_interval: Duration,
    pub max_missed_probes: u32,
    pub orphan_grace: Duration,
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        let health_check_interval = Duration::from_secs(30);
        Self {
            staleness_threshold: Duration::from_secs(120),
            health_check_interval,
            max_missed_probes: 3,
            orphan_grace: health_check_interval * 2,
            shutdown_grace: Duration::from_secs(25),
        }
    }
}

impl CoordinatorSettings {
    /// Reject values that would make the background loops spin or never
    /// declare a worker lost.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.staleness_threshold.is_zero(),
            "staleness_threshold must be positive"
        );
        anyhow::ensure!(
            !self.health_check_interval.is_zero(),
            "health_check_interval must be positive"
        );
        anyhow::ensure!(self.max_missed_probes > 0, "max_missed_probes must be at least 1");
        Ok(())
    }
}

/// Everything the coordinator's components share.
pub struct CoordinatorContext {
    pub persistence: Arc<dyn Persistence>,
    pub operations: OperationRegistry,
    pub checkpoints: CheckpointStore,
    pub workers: Arc<WorkerRegistry>,
    pub observer: Arc<dyn ExecutionObserver>,
    pub settings: CoordinatorSettings,
    shutdown: CancellationToken,
}

impl CoordinatorContext {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        policies: CheckpointPolicies,
        artifacts_dir: impl Into<PathBuf>,
        settings: CoordinatorSettings,
    ) -> Self {
        let checkpoints = CheckpointStore::new(
            persistence.clone(),
            ArtifactStore::new(artifacts_dir),
            policies,
        );
        let operations = OperationRegistry::new(persistence.clone(), checkpoints.clone());
        Self {
            persistence,
            operations,
            checkpoints,
            workers: Arc::new(WorkerRegistry::new()),
            observer: Arc::new(TracingObserver),
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the default tracing observer.
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Stop accepting registrations and dispatches.
    pub fn begin_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Coordinator entering shutdown");
            self.shutdown.cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        to_chrono(self.settings.staleness_threshold)
    }

    pub fn orphan_grace(&self) -> chrono::Duration {
        to_chrono(self.settings.orphan_grace)
    }

    pub fn health_check_interval(&self) -> chrono::Duration {
        to_chrono(self.settings.health_check_interval)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
