// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keel-coordinator integration tests.
//!
//! Provides a [`TestContext`] over a temporary SQLite database, a scriptable
//! [`FakeWorkerClient`], and helpers for driving the router in-process.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use keel_core::protocol::{ShutdownNotice, StartOperationRequest, WorkerHealthResponse};
use keel_core::{CheckpointPolicies, SqlitePersistence};
use keel_coordinator::context::{CoordinatorContext, CoordinatorSettings};
use keel_coordinator::dispatcher::{AdmitAll, Dispatcher, StartOutcome, WorkerCallError, WorkerClient};
use keel_coordinator::local_executor::LocalExecutor;
use keel_coordinator::reconciliation::ReconciliationEngine;
use keel_coordinator::server::{AppState, create_router};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// Calls recorded by [`FakeWorkerClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCall {
    Health(String),
    Start { endpoint: String, operation_id: String },
    Cancel { endpoint: String, operation_id: String, reason: String },
    ShutdownNotice(String),
}

/// In-memory [`WorkerClient`] whose answers are set per endpoint.
#[derive(Default)]
pub struct FakeWorkerClient {
    calls: Mutex<Vec<WorkerCall>>,
    down: Mutex<HashSet<String>>,
    busy: Mutex<HashSet<String>>,
    current: Mutex<HashMap<String, String>>,
}

impl FakeWorkerClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every call to `endpoint` fail with a transport error.
    pub fn set_down(&self, endpoint: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Make start requests to `endpoint` answer busy.
    pub fn set_busy(&self, endpoint: &str) {
        self.busy.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn calls(&self) -> Vec<WorkerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                WorkerCall::Start { operation_id, .. } => Some(operation_id),
                _ => None,
            })
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                WorkerCall::Cancel { operation_id, .. } => Some(operation_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: WorkerCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_up(&self, endpoint: &str) -> Result<(), WorkerCallError> {
        if self.down.lock().unwrap().contains(endpoint) {
            return Err(WorkerCallError::Transport {
                attempts: 1,
                details: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerClient for FakeWorkerClient {
    async fn health(&self, endpoint_url: &str) -> Result<WorkerHealthResponse, WorkerCallError> {
        self.record(WorkerCall::Health(endpoint_url.to_string()));
        self.check_up(endpoint_url)?;
        Ok(WorkerHealthResponse {
            worker_id: endpoint_url.to_string(),
            status: "ok".to_string(),
            current_operation_id: self.current.lock().unwrap().get(endpoint_url).cloned(),
        })
    }

    async fn start_operation(
        &self,
        endpoint_url: &str,
        request: &StartOperationRequest,
    ) -> Result<StartOutcome, WorkerCallError> {
        self.record(WorkerCall::Start {
            endpoint: endpoint_url.to_string(),
            operation_id: request.operation_id.clone(),
        });
        self.check_up(endpoint_url)?;
        if self.busy.lock().unwrap().contains(endpoint_url) {
            return Ok(StartOutcome::Busy);
        }
        self.current
            .lock()
            .unwrap()
            .insert(endpoint_url.to_string(), request.operation_id.clone());
        Ok(StartOutcome::Accepted)
    }

    async fn cancel_operation(
        &self,
        endpoint_url: &str,
        operation_id: &str,
        reason: &str,
    ) -> Result<(), WorkerCallError> {
        self.record(WorkerCall::Cancel {
            endpoint: endpoint_url.to_string(),
            operation_id: operation_id.to_string(),
            reason: reason.to_string(),
        });
        self.check_up(endpoint_url)?;
        self.current.lock().unwrap().remove(endpoint_url);
        Ok(())
    }

    async fn shutdown_notice(
        &self,
        endpoint_url: &str,
        _notice: &ShutdownNotice,
    ) -> Result<(), WorkerCallError> {
        self.record(WorkerCall::ShutdownNotice(endpoint_url.to_string()));
        self.check_up(endpoint_url)
    }
}

/// Settings with short timings for tests.
pub fn fast_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        staleness_threshold: Duration::from_millis(200),
        health_check_interval: Duration::from_secs(1),
        max_missed_probes: 2,
        orphan_grace: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(5),
    }
}

/// A coordinator over a temporary SQLite database, driven in-process.
pub struct TestContext {
    pub dir: TempDir,
    pub ctx: Arc<CoordinatorContext>,
    pub client: Arc<FakeWorkerClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub local: Arc<LocalExecutor>,
    pub router: Router,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_settings(fast_settings()).await
    }

    pub async fn with_settings(settings: CoordinatorSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::open(dir, settings, FakeWorkerClient::new(), |local| local).await
    }

    /// Open a coordinator over the database in `dir`, as after a restart.
    pub async fn open(
        dir: TempDir,
        settings: CoordinatorSettings,
        client: Arc<FakeWorkerClient>,
        configure_local: impl FnOnce(LocalExecutor) -> LocalExecutor,
    ) -> Self {
        let persistence = SqlitePersistence::from_path(dir.path().join("keel.db"))
            .await
            .unwrap();
        let ctx = Arc::new(CoordinatorContext::new(
            Arc::new(persistence),
            CheckpointPolicies::default(),
            dir.path().join("checkpoints"),
            settings,
        ));
        let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), client.clone(), Arc::new(AdmitAll)));
        let reconciliation = Arc::new(ReconciliationEngine::new(ctx.clone()));
        let local = Arc::new(configure_local(LocalExecutor::new(ctx.clone())));
        let router = create_router(AppState {
            ctx: ctx.clone(),
            dispatcher: dispatcher.clone(),
            reconciliation: reconciliation.clone(),
            local: local.clone(),
        });
        Self {
            dir,
            ctx,
            client,
            dispatcher,
            reconciliation,
            local,
            router,
        }
    }

    /// Simulate a backend restart: drop in-memory state, keep the database.
    pub async fn restart(self, settings: CoordinatorSettings) -> Self {
        let TestContext { dir, client, .. } = self;
        Self::open(dir, settings, client, |local| local).await
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.dir.path().join("checkpoints")
    }

    /// Send a JSON request through the router.
    pub async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(body)).await
    }

    pub async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::PUT, uri, Some(body)).await
    }

    /// Create an operation over HTTP and return its id.
    pub async fn create_operation(&self, operation_type: &str, metadata: Value) -> String {
        let (status, body) = self
            .post(
                "/api/v1/operations",
                serde_json::json!({"operation_type": operation_type, "metadata": metadata}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {}", body);
        body["operation_id"].as_str().unwrap().to_string()
    }

    /// Register a worker over HTTP.
    pub async fn register(&self, body: Value) -> (StatusCode, Value) {
        self.post("/api/v1/workers/register", body).await
    }

    pub async fn status_of(&self, operation_id: &str) -> String {
        let (status, body) = self.get(&format!("/api/v1/operations/{}", operation_id)).await;
        assert_eq!(status, StatusCode::OK, "get failed: {}", body);
        body["status"].as_str().unwrap().to_string()
    }
}

pub fn endpoint(worker_id: &str) -> String {
    format!("http://{}.test:9000", worker_id)
}
