// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution observer extension point.
//!
//! Jobs and executors report cycle boundaries, phase timings, and gate
//! decisions here. What happens to the events is up to the observer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::types::{OperationStatus, OperationType};

/// Receives execution events. All methods default to no-ops.
pub trait ExecutionObserver: Send + Sync {
    /// An operation began executing.
    fn cycle_started(&self, _operation_id: &str, _operation_type: &OperationType) {}

    /// An operation stopped executing with the given terminal status.
    fn cycle_finished(&self, _operation_id: &str, _status: OperationStatus, _elapsed: Duration) {}

    /// A named phase inside an operation took `elapsed`.
    fn phase_duration(&self, _operation_id: &str, _phase: &str, _elapsed: Duration) {}

    /// A named gate was evaluated.
    fn gate_evaluated(&self, _operation_id: &str, _gate: &str, _passed: bool) {}
}

/// Observer that writes every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn cycle_started(&self, operation_id: &str, operation_type: &OperationType) {
        info!(operation_id = %operation_id, operation_type = %operation_type, "Cycle started");
    }

    fn cycle_finished(&self, operation_id: &str, status: OperationStatus, elapsed: Duration) {
        info!(
            operation_id = %operation_id,
            status = %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Cycle finished"
        );
    }

    fn phase_duration(&self, operation_id: &str, phase: &str, elapsed: Duration) {
        info!(
            operation_id = %operation_id,
            phase = %phase,
            elapsed_ms = elapsed.as_millis() as u64,
            "Phase finished"
        );
    }

    fn gate_evaluated(&self, operation_id: &str, gate: &str, passed: bool) {
        info!(operation_id = %operation_id, gate = %gate, passed, "Gate evaluated");
    }
}

/// Reports a phase duration to the observer when dropped.
#[must_use = "the phase is reported when the timer is dropped"]
pub struct PhaseTimer {
    observer: Arc<dyn ExecutionObserver>,
    operation_id: String,
    phase: String,
    started: Instant,
}

impl PhaseTimer {
    pub fn start(
        observer: Arc<dyn ExecutionObserver>,
        operation_id: impl Into<String>,
        phase: impl Into<String>,
    ) -> Self {
        Self {
            observer,
            operation_id: operation_id.into(),
            phase: phase.into(),
            started: Instant::now(),
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.observer
            .phase_duration(&self.operation_id, &self.phase, self.started.elapsed());
    }
}
