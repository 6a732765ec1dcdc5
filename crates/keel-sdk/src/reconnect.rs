// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Re-registration with the coordinator.
//!
//! The coordinator keeps its worker registry in memory, so a restarted
//! coordinator only learns about a worker when the worker registers again.
//! Registration is requested when:
//! - the first registration at startup failed
//! - the coordinator sent a shutdown notice
//! - a call to the coordinator found it unreachable
//! - a heartbeat ack says the operation awaits reconciliation
//! - an outcome could not be reported
//!
//! and is refreshed periodically regardless.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::worker::Worker;

/// Flag plus wake-up for the reconnect loop.
#[derive(Debug, Default)]
pub struct RegistrationSignal {
    needed: AtomicBool,
    wake: Notify,
}

impl RegistrationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a registration as soon as the coordinator is reachable.
    pub fn request(&self) {
        self.needed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_needed(&self) -> bool {
        self.needed.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.needed.store(false, Ordering::SeqCst);
    }

    async fn notified(&self) {
        self.wake.notified().await;
    }
}

enum Wake {
    Requested,
    Timer,
}

/// Background task that keeps the worker registered.
pub struct ReconnectLoop {
    worker: Arc<Worker>,
    poll_interval: Duration,
    refresh_interval: Duration,
    shutdown: Arc<Notify>,
}

impl ReconnectLoop {
    pub fn new(worker: Arc<Worker>) -> Self {
        let poll_interval = worker.config().backend_poll_interval();
        let refresh_interval = worker.config().reregister_interval();
        Self {
            worker,
            poll_interval,
            refresh_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            refresh_interval_ms = self.refresh_interval.as_millis() as u64,
            "Reconnect loop started"
        );

        let signal = self.worker.registration();
        loop {
            let wait = if signal.is_needed() {
                self.poll_interval
            } else {
                self.refresh_interval
            };

            let wake = tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconnect loop received shutdown signal");
                    break;
                }

                _ = signal.notified() => Wake::Requested,

                _ = tokio::time::sleep(wait) => Wake::Timer,
            };

            if self.worker.is_shutting_down() {
                continue;
            }
            if matches!(wake, Wake::Timer) && !signal.is_needed() {
                debug!("Periodic re-registration");
                signal.needed.store(true, Ordering::SeqCst);
            }
            if !signal.is_needed() {
                continue;
            }

            if !self.worker.client().is_reachable().await {
                debug!("Coordinator unreachable, will retry");
                continue;
            }
            if let Err(e) = self.worker.register().await {
                warn!(error = %e, "Re-registration failed");
            }
        }

        info!("Reconnect loop stopped");
    }
}
