// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopback coordinator and worker for keel-sdk integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_coordinator::checkpoint_cleanup_worker::CheckpointCleanupConfig;
use keel_coordinator::context::CoordinatorSettings;
use keel_coordinator::dispatcher::RetryConfig;
use keel_coordinator::runtime::CoordinatorRuntime;
use keel_core::{Document, SqlitePersistence};
use keel_sdk::{JobHandler, OperationContext, SdkConfig, WorkerRuntime};
use serde_json::{Value, json};
use tokio::sync::Notify;

pub fn coordinator_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        staleness_threshold: Duration::from_secs(60),
        health_check_interval: Duration::from_millis(500),
        max_missed_probes: 3,
        orphan_grace: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(3),
    }
}

/// Start a coordinator over `{dir}/keel.db`, optionally on a fixed address.
pub async fn start_coordinator(dir: &Path, addr: Option<SocketAddr>) -> CoordinatorRuntime {
    let persistence = SqlitePersistence::from_path(dir.join("keel.db"))
        .await
        .unwrap();
    CoordinatorRuntime::builder()
        .persistence(Arc::new(persistence))
        .bind_addr(addr.unwrap_or_else(|| "127.0.0.1:0".parse().unwrap()))
        .data_dir(dir)
        .settings(coordinator_settings())
        .worker_retry(RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            request_timeout: Duration::from_secs(2),
        })
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

pub fn worker_config(worker_id: &str, backend_url: &str) -> SdkConfig {
    SdkConfig::new(worker_id, "training", backend_url)
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_heartbeat_interval_ms(50)
        .with_request_timeout_ms(1_000)
        .with_max_retries(0)
        .with_backend_poll_interval_ms(50)
        .with_reregister_interval_ms(60_000)
        .with_shutdown_grace_ms(3_000)
}

pub async fn start_worker(config: SdkConfig, handler: Arc<dyn JobHandler>) -> WorkerRuntime {
    WorkerRuntime::builder()
        .config(config)
        .handler("training", handler)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

pub fn doc(value: Value) -> Document {
    Document::from_value(value).unwrap()
}

/// Publishes `{"epoch": 4}`, then finishes on `release` or stops on cancel.
pub struct GatedTraining {
    pub release: Arc<Notify>,
    pub started: Arc<Notify>,
}

impl GatedTraining {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            release: Arc::new(Notify::new()),
            started: Arc::new(Notify::new()),
        })
    }
}

#[async_trait]
impl JobHandler for GatedTraining {
    async fn run(&self, ctx: OperationContext) -> Result<Option<Document>, String> {
        ctx.publish_state(doc(json!({"epoch": 4}))).await;
        ctx.report_progress(40.0, "epoch 4").await;
        self.started.notify_one();
        let token = ctx.cancellation_token();
        tokio::select! {
            _ = token.cancelled() => Ok(None),
            _ = self.release.notified() => Ok(Some(doc(json!({"accuracy": 0.91})))),
        }
    }
}

/// HTTP helpers against the coordinator API.
pub struct Api {
    pub http: reqwest::Client,
    pub base: String,
}

impl Api {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
        }
    }

    pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .http
            .post(format!("{}/api/v1{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .http
            .get(format!("{}/api/v1{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    pub async fn create(&self, metadata: Value) -> String {
        let (status, body) = self
            .post(
                "/operations",
                json!({"operation_type": "training", "metadata": metadata}),
            )
            .await;
        assert!(status == 200 || status == 201, "create returned {}: {}", status, body);
        body["operation_id"].as_str().unwrap().to_string()
    }

    pub async fn dispatch(&self, operation_id: &str) -> (u16, Value) {
        self.post(
            &format!("/operations/{}/dispatch", operation_id),
            json!({"worker_type": "training"}),
        )
        .await
    }

    pub async fn operation(&self, operation_id: &str) -> Value {
        let (status, body) = self.get(&format!("/operations/{}", operation_id)).await;
        assert_eq!(status, 200, "{}", body);
        body
    }

    /// Poll until the operation reaches `status`.
    pub async fn wait_for_status(&self, operation_id: &str, status: &str) -> Value {
        for _ in 0..100 {
            let op = self.operation(operation_id).await;
            if op["status"] == status {
                return op;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "operation {} never reached {}: {}",
            operation_id,
            status,
            self.operation(operation_id).await
        );
    }
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}
