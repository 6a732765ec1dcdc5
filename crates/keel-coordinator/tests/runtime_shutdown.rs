// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime startup and graceful shutdown over a real listener.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use keel_core::{
    CheckpointPolicies, CheckpointType, Document, NewOperation, OperationStatus, OperationType,
    Persistence, SqlitePersistence,
};
use keel_coordinator::checkpoint_cleanup_worker::CheckpointCleanupConfig;
use keel_coordinator::context::{CoordinatorContext, CoordinatorSettings};
use keel_coordinator::local_executor::{LocalJob, LocalJobContext};
use keel_coordinator::runtime::CoordinatorRuntime;
use keel_coordinator::shutdown::BACKEND_SHUTDOWN_REASON;
use serde_json::{Value, json};
use tempfile::TempDir;

/// Publishes a resumable state, then waits to be cancelled.
struct LongIngest;

#[async_trait]
impl LocalJob for LongIngest {
    async fn run(&self, ctx: LocalJobContext) -> Result<Option<Document>, String> {
        let state = Document::from_value(json!({"symbol": "EURUSD", "bars_loaded": 1200}))
            .map_err(|e| e.to_string())?;
        ctx.publish_state(state).await;
        ctx.cancellation_token().cancelled().await;
        Err("interrupted".to_string())
    }
}

async fn persistence(dir: &TempDir) -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::from_path(dir.path().join("keel.db"))
            .await
            .unwrap(),
    )
}

async fn start_runtime(
    dir: &TempDir,
    persistence: Arc<dyn Persistence>,
    settings: CoordinatorSettings,
    client: Arc<FakeWorkerClient>,
) -> CoordinatorRuntime {
    CoordinatorRuntime::builder()
        .persistence(persistence)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .data_dir(dir.path())
        .settings(settings)
        .worker_client(client)
        .local_job("data_load", Arc::new(LongIngest))
        .cleanup_config(CheckpointCleanupConfig {
            enabled: false,
            ..Default::default()
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn post(http: &reqwest::Client, url: String, body: Value) -> (u16, Value) {
    let response = http.post(url).json(&body).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_shutdown_notifies_workers_and_drains_local_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakeWorkerClient::new();
    let runtime = start_runtime(&dir, persistence(&dir).await, fast_settings(), client.clone()).await;
    let base = runtime.base_url();
    let http = reqwest::Client::new();

    let (status, _) = post(
        &http,
        format!("{}/api/v1/workers/register", base),
        json!({"worker_id": "w-1", "worker_type": "training", "endpoint_url": endpoint("w-1")}),
    )
    .await;
    assert_eq!(status, 200);

    let (status, created) = post(
        &http,
        format!("{}/api/v1/operations", base),
        json!({"operation_type": "data_load", "is_backend_local": true}),
    )
    .await;
    assert_eq!(status, 201);
    let id = created["operation_id"].as_str().unwrap().to_string();

    let (status, dispatched) = post(&http, format!("{}/api/v1/operations/{}/dispatch", base, id), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(dispatched["worker_id"], "backend-local");

    // Give the job time to publish its state.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runtime.local_executor().in_flight().await, vec![id.clone()]);

    let ctx: Arc<CoordinatorContext> = runtime.context().clone();
    let report = runtime.shutdown().await.unwrap();

    assert_eq!(report.notified_workers, vec!["w-1".to_string()]);
    assert!(report.unreachable_workers.is_empty());
    assert!(client.calls().contains(&WorkerCall::ShutdownNotice(endpoint("w-1"))));
    assert_eq!(report.drain.checkpointed, vec![id.clone()]);
    assert_eq!(report.drain.cancelled, vec![id.clone()]);
    assert!(report.drain.timed_out.is_empty());

    let op = ctx.operations.get(&id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert_eq!(op.error_message.as_deref(), Some(BACKEND_SHUTDOWN_REASON));

    let checkpoint = ctx.checkpoints.load_checkpoint(&id, false).await.unwrap().unwrap();
    assert_eq!(checkpoint.info.checkpoint_type, CheckpointType::Shutdown);
    assert_eq!(checkpoint.state.to_value()["bars_loaded"], 1200);

    // The listener is closed.
    assert!(http.get(format!("{}/health", base)).send().await.is_err());
}

#[tokio::test]
async fn test_unreachable_worker_does_not_block_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakeWorkerClient::new();
    client.set_down(&endpoint("w-down"), true);
    let runtime = start_runtime(&dir, persistence(&dir).await, fast_settings(), client.clone()).await;
    let http = reqwest::Client::new();

    for worker_id in ["w-up", "w-down"] {
        let (status, _) = post(
            &http,
            format!("{}/api/v1/workers/register", runtime.base_url()),
            json!({"worker_id": worker_id, "worker_type": "training", "endpoint_url": endpoint(worker_id)}),
        )
        .await;
        assert_eq!(status, 200);
    }

    let report = runtime.shutdown().await.unwrap();
    assert_eq!(report.notified_workers, vec!["w-up".to_string()]);
    assert_eq!(report.unreachable_workers, vec!["w-down".to_string()]);
    assert_eq!(report.drain, Default::default());
}

#[tokio::test]
async fn test_startup_sweep_demotes_stale_operations_before_serving() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = persistence(&dir).await;

    // State left behind by a previous run.
    let previous = CoordinatorContext::new(
        persistence.clone(),
        CheckpointPolicies::default(),
        dir.path().join("checkpoints"),
        fast_settings(),
    );
    let op = previous
        .operations
        .create_with(NewOperation::new(
            OperationType::new("training").unwrap(),
            Document::new(),
        ))
        .await
        .unwrap();
    previous
        .operations
        .start(&op.operation_id, Some("trainer-7"))
        .await
        .unwrap();
    drop(previous);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let runtime = start_runtime(&dir, persistence, fast_settings(), FakeWorkerClient::new()).await;
    let body: Value = reqwest::get(format!("{}/api/v1/operations/{}", runtime.base_url(), op.operation_id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "pending_reconciliation");
    assert_eq!(body["worker_id"], "trainer-7");

    runtime.shutdown().await.unwrap();
}
