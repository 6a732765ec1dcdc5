// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable worker runtime.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keel_sdk::{SdkConfig, WorkerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = WorkerRuntime::builder()
//!         .config(SdkConfig::from_env()?)
//!         .handler("training", Arc::new(TrainModel))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use keel_core::ExecutionObserver;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SdkConfig;
use crate::reconnect::ReconnectLoop;
use crate::server::router;
use crate::shutdown::{WorkerDrainReport, drain};
use crate::worker::{JobHandler, Worker};

/// Builder for creating a [`WorkerRuntime`].
#[derive(Default)]
pub struct WorkerRuntimeBuilder {
    config: Option<SdkConfig>,
    handlers: Vec<(String, Arc<dyn JobHandler>)>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl WorkerRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker configuration (required).
    pub fn config(mut self, config: SdkConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Run `handler` for operations of `operation_type`.
    pub fn handler(mut self, operation_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push((operation_type.into(), handler));
        self
    }

    /// Replace the default tracing observer.
    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        if self.handlers.is_empty() {
            return Err(anyhow::anyhow!("at least one handler is required"));
        }
        if config.worker_id.is_empty() {
            return Err(anyhow::anyhow!("worker_id must not be empty"));
        }
        Ok(WorkerRuntimeConfig {
            config,
            handlers: self.handlers,
            observer: self.observer,
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    config: SdkConfig,
    handlers: Vec<(String, Arc<dyn JobHandler>)>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl WorkerRuntimeConfig {
    /// Bind the worker endpoints, register, and start the reconnect loop.
    ///
    /// A coordinator that is down at startup is not an error: registration
    /// is retried in the background until it succeeds.
    pub async fn start(self) -> Result<WorkerRuntime> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let endpoint_url = self
            .config
            .endpoint_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", local_addr));

        let mut worker = Worker::new(self.config, endpoint_url)?;
        for (operation_type, handler) in self.handlers {
            worker = worker.with_handler(operation_type, handler);
        }
        if let Some(observer) = self.observer {
            worker = worker.with_observer(observer);
        }
        let worker = Arc::new(worker);

        let app = router(worker.clone());
        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });

        if let Err(e) = worker.register().await {
            warn!(error = %e, "Initial registration failed, retrying in background");
            worker.registration().request();
        }

        let reconnect = ReconnectLoop::new(worker.clone());
        let reconnect_shutdown = reconnect.shutdown_handle();
        let reconnect_handle = tokio::spawn(async move {
            reconnect.run().await;
        });

        info!(
            worker_id = %worker.worker_id(),
            local_addr = %local_addr,
            endpoint_url = %worker.endpoint_url(),
            backend_url = %worker.client().base_url(),
            "WorkerRuntime started"
        );

        Ok(WorkerRuntime {
            worker,
            local_addr,
            server_handle,
            reconnect_handle,
            server_shutdown_tx,
            reconnect_shutdown,
        })
    }
}

/// A running worker: HTTP endpoints, reconnect loop, and the execution slot.
pub struct WorkerRuntime {
    worker: Arc<Worker>,
    local_addr: SocketAddr,
    server_handle: JoinHandle<Result<()>>,
    reconnect_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    reconnect_shutdown: Arc<Notify>,
}

impl WorkerRuntime {
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint_url(&self) -> &str {
        self.worker.endpoint_url()
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Gracefully shut down: drain the slot, stop re-registering, then
    /// close the HTTP endpoints.
    pub async fn shutdown(self) -> Result<WorkerDrainReport> {
        info!("WorkerRuntime shutting down...");
        let report = drain(&self.worker).await;

        self.reconnect_shutdown.notify_one();
        if let Err(e) = self.reconnect_handle.await {
            error!("Reconnect loop task panicked: {}", e);
        }

        let _ = self.server_shutdown_tx.send(true);
        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("WorkerRuntime shutdown complete");
                Ok(report)
            }
            Ok(Err(e)) => {
                error!("WorkerRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                warn!("WorkerRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }
}
