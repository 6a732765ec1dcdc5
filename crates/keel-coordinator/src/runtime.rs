// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for keel-coordinator.
//!
//! [`CoordinatorRuntime`] wires the shared context, the background workers,
//! and the HTTP API together so the coordinator can run inside an existing
//! tokio application as well as from the `keel-coordinator` binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keel_core::SqlitePersistence;
//! use keel_coordinator::runtime::CoordinatorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/keel.db").await?);
//!
//!     let runtime = CoordinatorRuntime::builder()
//!         .persistence(persistence)
//!         .bind_addr("0.0.0.0:8080".parse()?)
//!         .data_dir(".data")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run until a termination signal ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use keel_core::{CheckpointPolicies, ExecutionObserver, Persistence};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::checkpoint_cleanup_worker::{CheckpointCleanupConfig, CheckpointCleanupWorker};
use crate::context::{CoordinatorContext, CoordinatorSettings};
use crate::dispatcher::{AdmissionGate, AdmitAll, Dispatcher, HttpWorkerClient, RetryConfig, WorkerClient};
use crate::heartbeat_monitor::{HeartbeatMonitor, HeartbeatMonitorConfig};
use crate::local_executor::{LocalExecutor, LocalJob};
use crate::reconciliation::ReconciliationEngine;
use crate::server::{AppState, create_router};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

/// Builder for creating a [`CoordinatorRuntime`].
pub struct CoordinatorRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    bind_addr: SocketAddr,
    data_dir: PathBuf,
    settings: CoordinatorSettings,
    policies: CheckpointPolicies,
    retry: RetryConfig,
    worker_client: Option<Arc<dyn WorkerClient>>,
    admission_gate: Arc<dyn AdmissionGate>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    local_jobs: Vec<(String, Arc<dyn LocalJob>)>,
    cleanup_config: CheckpointCleanupConfig,
}

impl Default for CoordinatorRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from(".data"),
            settings: CoordinatorSettings::default(),
            policies: CheckpointPolicies::default(),
            retry: RetryConfig::default(),
            worker_client: None,
            admission_gate: Arc::new(AdmitAll),
            observer: None,
            local_jobs: Vec::new(),
            cleanup_config: CheckpointCleanupConfig::default(),
        }
    }
}

impl CoordinatorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the bind address for the HTTP API. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the data directory; checkpoint artifacts live in `{data_dir}/checkpoints`.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the liveness and shutdown timing.
    pub fn settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the checkpoint policies.
    pub fn checkpoint_policies(mut self, policies: CheckpointPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Set retry behaviour of the default HTTP worker client.
    ///
    /// Ignored when [`worker_client`](Self::worker_client) is set.
    pub fn worker_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the HTTP worker client.
    pub fn worker_client(mut self, client: Arc<dyn WorkerClient>) -> Self {
        self.worker_client = Some(client);
        self
    }

    /// Set the gate consulted before each assignment.
    ///
    /// Default: [`AdmitAll`]
    pub fn admission_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.admission_gate = gate;
        self
    }

    /// Replace the default tracing observer.
    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Register a job for backend-local operations of `operation_type`.
    pub fn local_job(mut self, operation_type: impl Into<String>, job: Arc<dyn LocalJob>) -> Self {
        self.local_jobs.push((operation_type.into(), job));
        self
    }

    /// Set the checkpoint cleanup worker configuration.
    pub fn cleanup_config(mut self, config: CheckpointCleanupConfig) -> Self {
        self.cleanup_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<CoordinatorRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        self.settings.validate()?;
        self.cleanup_config.validate()?;
        let worker_client = match self.worker_client {
            Some(client) => client,
            None => Arc::new(HttpWorkerClient::new(self.retry)?),
        };

        Ok(CoordinatorRuntimeConfig {
            persistence,
            bind_addr: self.bind_addr,
            data_dir: self.data_dir,
            settings: self.settings,
            policies: self.policies,
            worker_client,
            admission_gate: self.admission_gate,
            observer: self.observer,
            local_jobs: self.local_jobs,
            cleanup_config: self.cleanup_config,
        })
    }
}

/// Configuration for a [`CoordinatorRuntime`].
pub struct CoordinatorRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    bind_addr: SocketAddr,
    data_dir: PathBuf,
    settings: CoordinatorSettings,
    policies: CheckpointPolicies,
    worker_client: Arc<dyn WorkerClient>,
    admission_gate: Arc<dyn AdmissionGate>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    local_jobs: Vec<(String, Arc<dyn LocalJob>)>,
    cleanup_config: CheckpointCleanupConfig,
}

impl CoordinatorRuntimeConfig {
    /// Start the runtime.
    ///
    /// Stale running operations are demoted before the HTTP listener is
    /// bound, so no registration is served against pre-restart state.
    pub async fn start(self) -> Result<CoordinatorRuntime> {
        let mut ctx = CoordinatorContext::new(
            self.persistence,
            self.policies,
            self.data_dir.join("checkpoints"),
            self.settings,
        );
        if let Some(observer) = self.observer {
            ctx = ctx.with_observer(observer);
        }
        let ctx = Arc::new(ctx);

        let reconciliation = Arc::new(ReconciliationEngine::new(ctx.clone()));
        reconciliation.startup_sweep().await?;

        let dispatcher = Arc::new(Dispatcher::new(
            ctx.clone(),
            self.worker_client.clone(),
            self.admission_gate,
        ));

        let mut local = LocalExecutor::new(ctx.clone());
        for (operation_type, job) in self.local_jobs {
            local = local.with_job(operation_type, job);
        }
        let local = Arc::new(local);

        // Heartbeat monitor
        let monitor = HeartbeatMonitor::new(
            ctx.clone(),
            reconciliation.clone(),
            self.worker_client.clone(),
            HeartbeatMonitorConfig {
                poll_interval: ctx.settings.health_check_interval,
            },
        );
        let monitor_shutdown = monitor.shutdown_handle();
        let monitor_handle = tokio::spawn(async move {
            monitor.run().await;
        });

        // Checkpoint cleanup worker
        let cleanup_worker = CheckpointCleanupWorker::new(ctx.checkpoints.clone(), self.cleanup_config);
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        // HTTP API
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let router = create_router(AppState {
            ctx: ctx.clone(),
            dispatcher: dispatcher.clone(),
            reconciliation: reconciliation.clone(),
            local: local.clone(),
        });
        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });

        info!(
            local_addr = %local_addr,
            data_dir = %self.data_dir.display(),
            "CoordinatorRuntime started"
        );

        Ok(CoordinatorRuntime {
            ctx,
            dispatcher,
            reconciliation,
            local,
            worker_client: self.worker_client,
            server_handle,
            monitor_handle,
            cleanup_handle,
            server_shutdown_tx,
            monitor_shutdown,
            cleanup_shutdown,
            local_addr,
        })
    }
}

/// A running coordinator.
///
/// The runtime manages:
/// - the HTTP API
/// - the heartbeat monitor (worker probes, stale sweep, orphan detection)
/// - the checkpoint cleanup worker
/// - backend-local executions
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CoordinatorRuntime {
    ctx: Arc<CoordinatorContext>,
    dispatcher: Arc<Dispatcher>,
    reconciliation: Arc<ReconciliationEngine>,
    local: Arc<LocalExecutor>,
    worker_client: Arc<dyn WorkerClient>,
    server_handle: JoinHandle<Result<()>>,
    monitor_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    monitor_shutdown: Arc<Notify>,
    cleanup_shutdown: Arc<Notify>,
    local_addr: SocketAddr,
}

impl CoordinatorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CoordinatorRuntimeBuilder {
        CoordinatorRuntimeBuilder::new()
    }

    /// Address the HTTP API is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL of the HTTP API, e.g. `http://127.0.0.1:8080`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn context(&self) -> &Arc<CoordinatorContext> {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciliation
    }

    pub fn local_executor(&self) -> &Arc<LocalExecutor> {
        &self.local
    }

    /// Gracefully shut down the runtime.
    ///
    /// Rejects new registrations, notifies workers, drains backend-local
    /// executions within the grace period, then stops the background workers
    /// and finally the HTTP server.
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        info!("CoordinatorRuntime shutting down...");

        let report = ShutdownCoordinator::new(self.ctx.clone(), self.worker_client.clone(), self.local.clone())
            .shutdown()
            .await;

        // Signal background workers
        self.monitor_shutdown.notify_one();
        self.cleanup_shutdown.notify_one();

        if let Err(e) = self.monitor_handle.await {
            error!("Heartbeat monitor task panicked: {}", e);
        }
        if let Err(e) = self.cleanup_handle.await {
            error!("Checkpoint cleanup worker task panicked: {}", e);
        }

        // Stop the HTTP server last
        let _ = self.server_shutdown_tx.send(true);
        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("CoordinatorRuntime shutdown complete");
                Ok(report)
            }
            Ok(Err(e)) => {
                error!("CoordinatorRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                warn!("CoordinatorRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && !self.monitor_handle.is_finished()
            && !self.cleanup_handle.is_finished()
    }
}
