// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end operation lifecycle through the coordinator HTTP API:
//! dispatch, heartbeat, checkpoint, backend restart, reclaim, completion,
//! and cancellation.

mod common;

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use common::*;
use serde_json::json;

#[tokio::test]
async fn test_training_operation_survives_backend_restart() {
    let tc = TestContext::new().await;

    // 1. Create and dispatch.
    let op_1 = tc
        .create_operation("training", json!({"symbol": "EURUSD", "timeframe": "1h"}))
        .await;
    assert_eq!(tc.status_of(&op_1).await, "pending");

    let (status, _) = tc
        .register(json!({
            "worker_id": "training-worker-1",
            "worker_type": "training",
            "endpoint_url": endpoint("training-worker-1"),
        }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = tc
        .post(
            &format!("/api/v1/operations/{}/dispatch", op_1),
            json!({"worker_type": "training"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["worker_id"], "training-worker-1");
    assert_eq!(tc.client.started(), vec![op_1.clone()]);

    let (_, op) = tc.get(&format!("/api/v1/operations/{}", op_1)).await;
    assert_eq!(op["status"], "running");
    assert_eq!(op["worker_id"], "training-worker-1");
    assert!(op["started_at"].is_string());

    // 2. Heartbeat and checkpoint.
    let (status, ack) = tc
        .post(
            &format!("/api/v1/operations/{}/heartbeat", op_1),
            json!({"worker_id": "training-worker-1", "progress_percent": 42.0, "progress_message": "epoch 30"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["accepted"], true);
    assert_eq!(ack["status"], "running");
    assert_eq!(ack["cancel_requested"], false);

    let (status, info) = tc
        .put(
            &format!("/api/v1/operations/{}/checkpoint", op_1),
            json!({"checkpoint_type": "periodic", "state": {"epoch": 30}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", info);
    assert_eq!(info["checkpoint_type"], "periodic");
    assert!(info["state_size_bytes"].as_i64().unwrap() > 0);

    // 3. Backend restarts; the stale heartbeat demotes the operation.
    let tc = tc.restart(fast_settings()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let demoted = tc.reconciliation.startup_sweep().await.unwrap();
    assert_eq!(demoted, vec![op_1.clone()]);
    assert_eq!(tc.status_of(&op_1).await, "pending_reconciliation");

    // 4. The worker re-registers and reclaims it.
    let (status, body) = tc
        .register(json!({
            "worker_id": "training-worker-1",
            "worker_type": "training",
            "endpoint_url": endpoint("training-worker-1"),
            "current_operation_id": op_1,
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["reconciliation"]["reclaimed"], op_1.as_str());
    let (_, op) = tc.get(&format!("/api/v1/operations/{}", op_1)).await;
    assert_eq!(op["status"], "running");
    assert_eq!(op["worker_id"], "training-worker-1");
    assert_eq!(op["reconciliation_status"], "reconciled");

    let (_, checkpoint) = tc
        .get(&format!("/api/v1/operations/{}/checkpoint", op_1))
        .await;
    assert_eq!(checkpoint["state"]["epoch"], 30);

    // 5. The worker reports completion; the checkpoint goes with it.
    let (status, body) = tc
        .register(json!({
            "worker_id": "training-worker-1",
            "worker_type": "training",
            "endpoint_url": endpoint("training-worker-1"),
            "completed_operations": [
                {"operation_id": op_1, "status": "completed", "result": {"accuracy": 0.83}}
            ],
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["reconciliation"]["applied"][0]["status"], "completed");

    let (_, op) = tc.get(&format!("/api/v1/operations/{}", op_1)).await;
    assert_eq!(op["status"], "completed");
    assert_eq!(op["result"]["accuracy"], 0.83);

    let (status, body) = tc
        .get(&format!("/api/v1/operations/{}/checkpoint", op_1))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CHECKPOINT_NOT_FOUND");
    assert_eq!(body["retryable"], false);

    // A late heartbeat learns the operation is over.
    let (status, ack) = tc
        .post(
            &format!("/api/v1/operations/{}/heartbeat", op_1),
            json!({"worker_id": "training-worker-1"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["accepted"], false);
    assert_eq!(ack["status"], "completed");
}

#[tokio::test]
async fn test_cancel_returns_child_and_reaches_worker() {
    let tc = TestContext::new().await;
    tc.register(json!({
        "worker_id": "research-worker-1",
        "worker_type": "research_cycle",
        "endpoint_url": endpoint("research-worker-1"),
    }))
    .await;

    let op_2 = tc.create_operation("research_cycle", json!({"goal": "momentum"})).await;
    tc.post(
        &format!("/api/v1/operations/{}/dispatch", op_2),
        json!({"worker_type": "research_cycle"}),
    )
    .await;

    let (status, child) = tc
        .post(
            "/api/v1/operations",
            json!({"operation_type": "backtesting", "parent_operation_id": op_2}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let child_id = child["operation_id"].as_str().unwrap().to_string();

    let started = Instant::now();
    let (status, body) = tc
        .post(
            &format!("/api/v1/operations/{}/cancel", op_2),
            json!({"reason": "operator abort"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(body["success"], true);
    assert_eq!(body["operation_id"], op_2.as_str());
    assert_eq!(body["child_operation_id"], child_id.as_str());

    let (_, op) = tc.get(&format!("/api/v1/operations/{}", op_2)).await;
    assert_eq!(op["status"], "cancelled");
    assert_eq!(op["error_message"], "operator abort");
    assert_eq!(tc.client.cancelled(), vec![op_2.clone()]);

    // The worker slot is free again.
    let worker = tc.ctx.workers.get("research-worker-1").await.unwrap();
    assert!(worker.current_operation_id.is_none());

    // The owner's next heartbeat is told to stop.
    let (_, ack) = tc
        .post(
            &format!("/api/v1/operations/{}/heartbeat", op_2),
            json!({"worker_id": "research-worker-1"}),
        )
        .await;
    assert_eq!(ack["cancel_requested"], true);
}

#[tokio::test]
async fn test_cancel_without_body_uses_default_reason() {
    let tc = TestContext::new().await;
    tc.register(json!({
        "worker_id": "bt-1",
        "worker_type": "backtesting",
        "endpoint_url": endpoint("bt-1"),
    }))
    .await;
    let id = tc.create_operation("backtesting", json!({})).await;
    tc.post(
        &format!("/api/v1/operations/{}/dispatch", id),
        json!({"worker_type": "backtesting"}),
    )
    .await;

    let (status, body) = tc
        .send(
            axum::http::Method::POST,
            &format!("/api/v1/operations/{}/cancel", id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(body["child_operation_id"].is_null());
    assert_eq!(tc.status_of(&id).await, "cancelled");
}

#[tokio::test]
async fn test_error_bodies() {
    let tc = TestContext::new().await;

    let (status, body) = tc.get("/api/v1/operations/op_missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "OPERATION_NOT_FOUND");

    let (status, body) = tc
        .post("/api/v1/operations", json!({"operation_type": "Not A Type"}))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["retryable"], false);

    let id = tc.create_operation("data_load", json!({})).await;
    let (status, body) = tc
        .post(&format!("/api/v1/operations/{}/cancel", id), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");

    let (status, body) = tc
        .post(
            &format!("/api/v1/operations/{}/dispatch", id),
            json!({"worker_type": "data_load"}),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "NO_WORKER_AVAILABLE");
    assert_eq!(body["retryable"], true);
    assert_eq!(tc.status_of(&id).await, "pending");
}

#[tokio::test]
async fn test_list_filters_active_operations() {
    let tc = TestContext::new().await;
    tc.register(json!({
        "worker_id": "loader-1",
        "worker_type": "data_load",
        "endpoint_url": endpoint("loader-1"),
    }))
    .await;

    let running = tc.create_operation("data_load", json!({"source": "ticks"})).await;
    tc.post(
        &format!("/api/v1/operations/{}/dispatch", running),
        json!({"worker_type": "data_load"}),
    )
    .await;
    let pending = tc.create_operation("training", json!({})).await;

    let (status, page) = tc.get("/api/v1/operations?active_only=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 2);

    let (_, page) = tc.get("/api/v1/operations?status=running").await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["operations"][0]["operation_id"], running.as_str());

    let (_, page) = tc.get("/api/v1/operations?operation_type=training").await;
    assert_eq!(page["operations"][0]["operation_id"], pending.as_str());

    let (_, page) = tc.get("/api/v1/operations?limit=1&offset=1").await;
    assert_eq!(page["operations"].as_array().unwrap().len(), 1);
    assert_eq!(page["limit"], 1);
}

#[tokio::test]
async fn test_checkpoint_artifacts_round_trip_over_http() {
    let tc = TestContext::new().await;
    let id = tc.create_operation("training", json!({})).await;

    // "weights" and "optimizer" base64-encoded.
    let (status, info) = tc
        .put(
            &format!("/api/v1/operations/{}/checkpoint", id),
            json!({
                "checkpoint_type": "manual",
                "state": {"epoch": 12},
                "artifacts": {"model.bin": "d2VpZ2h0cw==", "optim.bin": "b3B0aW1pemVy"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", info);
    let artifacts_path = info["artifacts_path"].as_str().unwrap().to_string();
    assert!(artifacts_path.starts_with(tc.artifacts_root().to_str().unwrap()));
    assert!(info["artifacts_size_bytes"].as_i64().unwrap() > 0);

    let (_, without) = tc
        .get(&format!("/api/v1/operations/{}/checkpoint", id))
        .await;
    assert!(without.get("artifacts").is_none());

    let (status, loaded) = tc
        .get(&format!("/api/v1/operations/{}/checkpoint?load_artifacts=true", id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(loaded["state"]["epoch"], 12);
    assert_eq!(loaded["artifacts"]["model.bin"], "d2VpZ2h0cw==");
    assert_eq!(loaded["artifacts"]["optim.bin"], "b3B0aW1pemVy");

    let (status, body) = tc
        .put(
            &format!("/api/v1/operations/{}/checkpoint", id),
            json!({"checkpoint_type": "manual", "state": {}, "artifacts": {"x": "not base64!"}}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_checkpoint_artifacts_path_outside_store_is_rejected() {
    let tc = TestContext::new().await;
    let id = tc.create_operation("training", json!({})).await;
    let escape = tc.artifacts_root().join("..").to_string_lossy().into_owned();

    for path in ["/", "../keel.db", escape.as_str()] {
        let (status, body) = tc
            .put(
                &format!("/api/v1/operations/{}/checkpoint", id),
                json!({"checkpoint_type": "manual", "state": {}, "artifacts_path": path}),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{}: {}", path, body);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    let (status, _) = tc
        .get(&format!("/api/v1/operations/{}/checkpoint", id))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fail_saves_failure_checkpoint() {
    let tc = TestContext::new().await;
    tc.register(json!({
        "worker_id": "trainer-9",
        "worker_type": "training",
        "endpoint_url": endpoint("trainer-9"),
    }))
    .await;
    let id = tc.create_operation("training", json!({})).await;
    tc.post(
        &format!("/api/v1/operations/{}/dispatch", id),
        json!({"worker_type": "training"}),
    )
    .await;

    let (status, op) = tc
        .post(
            &format!("/api/v1/operations/{}/fail", id),
            json!({
                "worker_id": "trainer-9",
                "error_message": "loss diverged",
                "failure_state": {"epoch": 4, "loss": "nan"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", op);
    assert_eq!(op["status"], "failed");
    assert_eq!(op["error_message"], "loss diverged");

    let (_, checkpoint) = tc
        .get(&format!("/api/v1/operations/{}/checkpoint", id))
        .await;
    assert_eq!(checkpoint["checkpoint_type"], "failure");
    assert_eq!(checkpoint["state"]["epoch"], 4);
    assert!(tc.ctx.workers.get("trainer-9").await.unwrap().current_operation_id.is_none());

    // A second outcome is rejected.
    let (status, body) = tc
        .post(
            &format!("/api/v1/operations/{}/complete", id),
            json!({"worker_id": "trainer-9"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn test_health_endpoints() {
    let tc = TestContext::new().await;
    let (status, body) = tc.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["shutting_down"], false);

    let (status, _) = tc.get("/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
}
