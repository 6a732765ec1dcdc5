// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for expiring old checkpoints.
//!
//! Each cycle:
//! 1. Deletes checkpoints older than `max_age` in batches, removing their
//!    artifact directories.
//! 2. Measures usage of the disk holding the artifact root and warns when it
//!    is above `warn_disk_usage_percent`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keel_core::CheckpointStore;
use serde::Serialize;
use sysinfo::Disks;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Configuration for the checkpoint cleanup worker.
#[derive(Debug, Clone)]
pub struct CheckpointCleanupConfig {
    /// Whether cleanup runs at all.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Checkpoints older than this are deleted.
    pub max_age: Duration,
    /// Maximum checkpoints deleted per batch.
    pub batch_size: i64,
    /// Disk usage percentage above which a warning is logged.
    pub warn_disk_usage_percent: f64,
}

impl Default for CheckpointCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(24 * 3600), // 1 day
            max_age: Duration::from_secs(30 * 24 * 3600),  // 30 days
            batch_size: 100,
            warn_disk_usage_percent: 80.0,
        }
    }
}

impl CheckpointCleanupConfig {
    /// An enabled worker needs a positive poll interval and batch size.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        anyhow::ensure!(!self.poll_interval.is_zero(), "cleanup poll_interval must be positive");
        anyhow::ensure!(self.batch_size > 0, "cleanup batch_size must be positive");
        Ok(())
    }
}

/// Outcome of one cleanup cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub deleted: usize,
    /// `None` when no mounted disk contains the artifact root.
    pub disk_usage_percent: Option<f64>,
    pub over_threshold: bool,
}

/// Background worker that deletes expired checkpoints.
pub struct CheckpointCleanupWorker {
    checkpoints: CheckpointStore,
    config: CheckpointCleanupConfig,
    shutdown: Arc<Notify>,
}

impl CheckpointCleanupWorker {
    pub fn new(checkpoints: CheckpointStore, config: CheckpointCleanupConfig) -> Self {
        Self {
            checkpoints,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown is signalled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Checkpoint cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            warn_disk_usage_percent = self.config.warn_disk_usage_percent,
            "Checkpoint cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Checkpoint cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Checkpoint cleanup cycle failed");
                    }
                }
            }
        }

        info!("Checkpoint cleanup worker stopped");
    }

    /// Run one cleanup cycle.
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let deleted = self
            .checkpoints
            .delete_older_than(max_age, self.config.batch_size)
            .await?;

        let root = self.checkpoints.artifacts().root().to_path_buf();
        let disk_usage_percent = tokio::task::spawn_blocking(move || disk_usage_percent(&root))
            .await
            .map_err(|e| Error::Other(format!("disk usage probe failed: {}", e)))?;

        let over_threshold =
            disk_usage_percent.is_some_and(|usage| usage > self.config.warn_disk_usage_percent);
        if let Some(usage) = disk_usage_percent {
            if over_threshold {
                warn!(
                    disk_usage_percent = usage,
                    threshold = self.config.warn_disk_usage_percent,
                    "Checkpoint disk usage above threshold"
                );
            } else {
                debug!(disk_usage_percent = usage, "Checkpoint disk usage");
            }
        }

        debug!(deleted, "Checkpoint cleanup cycle completed");
        Ok(CleanupReport {
            deleted,
            disk_usage_percent,
            over_threshold,
        })
    }
}

/// Usage of the disk whose mount point is the longest prefix of `path`.
fn disk_usage_percent(path: &Path) -> Option<f64> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())?;
    usage_percent(disk.total_space(), disk.available_space())
}

fn usage_percent(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}
