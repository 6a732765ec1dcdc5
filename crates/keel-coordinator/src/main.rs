// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Coordinator - Operation Lifecycle Server
//!
//! An HTTP server responsible for:
//! - Operation registry (create, list, cancel, heartbeat, complete, fail)
//! - Checkpoint storage
//! - Worker registration and reconciliation
//! - Dispatching operations to idle workers

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use keel_core::{ExclusiveLock, Persistence, PostgresPersistence, SqlitePersistence};
use keel_coordinator::config::Config;
use keel_coordinator::context::CoordinatorSettings;
use keel_coordinator::runtime::CoordinatorRuntime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_coordinator=info,keel_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        data_dir = %config.data_dir.display(),
        "Starting Keel Coordinator"
    );

    // One coordinator per data directory
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let _lock = ExclusiveLock::with_default_liveness(config.lock_path()).acquire()?;

    let persistence = connect(&config.database_url).await?;
    info!("Connected to database");

    let settings = CoordinatorSettings {
        staleness_threshold: config.staleness_threshold,
        health_check_interval: config.health_check_interval,
        max_missed_probes: config.max_missed_probes,
        orphan_grace: config.orphan_grace,
        shutdown_grace: config.shutdown_grace,
    };

    // Start the runtime
    let runtime = CoordinatorRuntime::builder()
        .persistence(persistence)
        .bind_addr(config.http_addr)
        .data_dir(&config.data_dir)
        .settings(settings)
        .checkpoint_policies(keel_core::CheckpointPolicies::new(config.checkpoint_policy.clone()))
        .worker_retry(config.worker_retry.clone())
        .cleanup_config(config.cleanup.clone())
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Coordinator server ready");

    wait_for_signal().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    let report = runtime.shutdown().await?;

    info!(
        notified_workers = report.notified_workers.len(),
        drained = report.drain.cancelled.len(),
        "Keel Coordinator shut down"
    );

    Ok(())
}

/// Connect to SQLite or PostgreSQL by URL scheme and apply migrations.
async fn connect(database_url: &str) -> anyhow::Result<Arc<dyn Persistence>> {
    if database_url.starts_with("sqlite:") {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        keel_core::migrations::run_sqlite(&pool).await?;
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        keel_core::migrations::run_postgres(&pool).await?;
        Ok(Arc::new(PostgresPersistence::new(pool)))
    } else {
        anyhow::bail!("unsupported KEEL_DATABASE_URL scheme: {}", database_url)
    }
}

/// Wait for SIGINT, or SIGTERM on unix.
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
