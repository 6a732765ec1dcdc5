// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry of remote workers.
//!
//! Workers re-register after every coordinator restart, so nothing here is
//! persisted. The registry also holds each worker's execution slot:
//! [`WorkerRegistry::try_reserve`] claims an idle worker for an operation
//! under the registry's write lock, so two concurrent dispatches can never
//! pick the same worker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Health of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Registered recently or answered its last probe.
    Healthy,
    /// Missed at least one probe, but fewer than the unhealthy threshold.
    Unknown,
    /// Missed too many consecutive probes.
    Unhealthy,
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub worker_type: String,
    pub endpoint_url: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub current_operation_id: Option<String>,
    /// `None` until the first probe.
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub missed_probes: u32,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// Whether this worker still counts as the live owner of its operation.
    pub fn protects_claims(&self) -> bool {
        self.health_status != HealthStatus::Unhealthy
    }
}

/// Values supplied at registration.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub worker_type: String,
    pub endpoint_url: String,
}

/// Result of recording a failed probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeFailure {
    pub missed_probes: u32,
    /// The worker crossed the unhealthy threshold on this probe.
    pub became_unhealthy: bool,
    pub current_operation_id: Option<String>,
}

/// Registry of remote workers and their execution slots.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a worker.
    ///
    /// Re-registration refreshes endpoint, type, heartbeat and health but keeps
    /// the execution slot and probe history.
    pub async fn register(&self, registration: WorkerRegistration) -> Worker {
        let now = Utc::now();
        let mut workers = self.workers.write().await;
        let worker = workers
            .entry(registration.worker_id.clone())
            .and_modify(|w| {
                w.worker_type = registration.worker_type.clone();
                w.endpoint_url = registration.endpoint_url.clone();
                w.last_heartbeat_at = now;
                w.health_status = HealthStatus::Healthy;
                w.missed_probes = 0;
            })
            .or_insert_with(|| Worker {
                worker_id: registration.worker_id.clone(),
                worker_type: registration.worker_type.clone(),
                endpoint_url: registration.endpoint_url.clone(),
                registered_at: now,
                last_heartbeat_at: now,
                health_status: HealthStatus::Healthy,
                current_operation_id: None,
                last_health_check_at: None,
                missed_probes: 0,
                last_assigned_at: None,
            });

        info!(
            worker_id = %worker.worker_id,
            worker_type = %worker.worker_type,
            endpoint_url = %worker.endpoint_url,
            "Worker registered"
        );
        worker.clone()
    }

    pub async fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// All workers, ordered by id.
    pub async fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub async fn remove(&self, worker_id: &str) -> Option<Worker> {
        self.workers.write().await.remove(worker_id)
    }

    /// Whether `worker_id` is registered and not unhealthy.
    pub async fn protects_claims(&self, worker_id: &str) -> bool {
        self.workers
            .read()
            .await
            .get(worker_id)
            .is_some_and(Worker::protects_claims)
    }

    /// Reserve an idle healthy worker of `worker_type` for `operation_id`.
    ///
    /// Picks the least recently assigned candidate.
    pub async fn try_reserve(&self, worker_type: &str, operation_id: &str) -> Option<Worker> {
        let mut workers = self.workers.write().await;
        let candidate = workers
            .values_mut()
            .filter(|w| {
                w.worker_type == worker_type
                    && w.health_status == HealthStatus::Healthy
                    && w.current_operation_id.is_none()
            })
            .min_by(|a, b| {
                a.last_assigned_at
                    .cmp(&b.last_assigned_at)
                    .then_with(|| a.worker_id.cmp(&b.worker_id))
            })?;

        candidate.current_operation_id = Some(operation_id.to_string());
        candidate.last_assigned_at = Some(Utc::now());
        debug!(
            worker_id = %candidate.worker_id,
            operation_id = %operation_id,
            "Worker slot reserved"
        );
        Some(candidate.clone())
    }

    /// Free the worker's slot if it still holds `operation_id`.
    pub async fn release(&self, worker_id: &str, operation_id: &str) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(w) if w.current_operation_id.as_deref() == Some(operation_id) => {
                w.current_operation_id = None;
                debug!(worker_id = %worker_id, operation_id = %operation_id, "Worker slot released");
                true
            }
            _ => false,
        }
    }

    /// Point the worker's slot at `operation_id`, freeing it from any other worker.
    pub async fn assign(&self, worker_id: &str, operation_id: &str) {
        let mut workers = self.workers.write().await;
        for w in workers.values_mut() {
            if w.worker_id != worker_id && w.current_operation_id.as_deref() == Some(operation_id) {
                w.current_operation_id = None;
            }
        }
        if let Some(w) = workers.get_mut(worker_id) {
            if let Some(previous) = w.current_operation_id.as_deref()
                && previous != operation_id
            {
                warn!(
                    worker_id = %worker_id,
                    previous = %previous,
                    operation_id = %operation_id,
                    "Worker slot overwritten"
                );
            }
            w.current_operation_id = Some(operation_id.to_string());
        }
    }

    /// Free the worker's slot unconditionally.
    pub async fn clear_slot(&self, worker_id: &str) {
        if let Some(w) = self.workers.write().await.get_mut(worker_id) {
            w.current_operation_id = None;
        }
    }

    /// Free whichever slot holds `operation_id`.
    pub async fn clear_operation(&self, operation_id: &str) -> Option<String> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .values_mut()
            .find(|w| w.current_operation_id.as_deref() == Some(operation_id))?;
        worker.current_operation_id = None;
        Some(worker.worker_id.clone())
    }

    /// Record a heartbeat relayed through an operation.
    pub async fn touch(&self, worker_id: &str) {
        if let Some(w) = self.workers.write().await.get_mut(worker_id) {
            w.last_heartbeat_at = Utc::now();
        }
    }

    /// Workers due for a probe: never probed, or probed at least `interval` ago.
    pub async fn due_for_probe(&self, interval: chrono::Duration) -> Vec<Worker> {
        let now = Utc::now();
        self.workers
            .read()
            .await
            .values()
            .filter(|w| match w.last_health_check_at {
                None => true,
                Some(at) => now - at >= interval,
            })
            .cloned()
            .collect()
    }

    pub async fn record_probe_success(&self, worker_id: &str) {
        let now = Utc::now();
        if let Some(w) = self.workers.write().await.get_mut(worker_id) {
            if w.health_status != HealthStatus::Healthy {
                info!(worker_id = %worker_id, "Worker healthy again");
            }
            w.health_status = HealthStatus::Healthy;
            w.missed_probes = 0;
            w.last_health_check_at = Some(now);
            w.last_heartbeat_at = now;
        }
    }

    /// Count a failed probe. The worker turns unhealthy at `max_missed`.
    pub async fn record_probe_failure(&self, worker_id: &str, max_missed: u32) -> Option<ProbeFailure> {
        let mut workers = self.workers.write().await;
        let w = workers.get_mut(worker_id)?;
        w.missed_probes = w.missed_probes.saturating_add(1);
        w.last_health_check_at = Some(Utc::now());

        let was_unhealthy = w.health_status == HealthStatus::Unhealthy;
        w.health_status = if w.missed_probes >= max_missed.max(1) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Unknown
        };
        let became_unhealthy = !was_unhealthy && w.health_status == HealthStatus::Unhealthy;
        if became_unhealthy {
            warn!(
                worker_id = %worker_id,
                missed_probes = w.missed_probes,
                current_operation_id = ?w.current_operation_id,
                "Worker marked unhealthy"
            );
        }

        Some(ProbeFailure {
            missed_probes: w.missed_probes,
            became_unhealthy,
            current_operation_id: w.current_operation_id.clone(),
        })
    }
}
