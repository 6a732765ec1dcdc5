// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher and exclusivity controller.
//!
//! Assigns `pending` operations to idle workers. The worker's slot is
//! reserved in the [`WorkerRegistry`](crate::worker_registry::WorkerRegistry)
//! before any network call, and released again on every failure path, so a
//! worker never holds two operations and an operation whose start request
//! could not be delivered stays `pending`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::error::CoreError;
use keel_core::protocol::{
    ShutdownNotice, StartOperationRequest, StartOperationResponse, WorkerCancelRequest,
    WorkerHealthResponse, worker_paths,
};
use keel_core::{Operation, OperationStatus};
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::CoordinatorContext;
use crate::error::{Error, Result};

// ============================================================================
// Worker client
// ============================================================================

/// Retry behaviour for coordinator -> worker calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Failure of a call to a worker endpoint.
#[derive(Debug, thiserror::Error)]
pub enum WorkerCallError {
    /// Connection, timeout, or 5xx after all retries.
    #[error("transport failure after {attempts} attempts: {details}")]
    Transport { attempts: u32, details: String },
    /// The worker answered with a non-retryable status.
    #[error("worker answered {status}: {body}")]
    Status { status: u16, body: String },
    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Outcome of a start request the worker answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
    /// The worker is already executing something.
    Busy,
}

/// Calls the coordinator makes to worker endpoints.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn health(&self, endpoint_url: &str) -> std::result::Result<WorkerHealthResponse, WorkerCallError>;

    async fn start_operation(
        &self,
        endpoint_url: &str,
        request: &StartOperationRequest,
    ) -> std::result::Result<StartOutcome, WorkerCallError>;

    async fn cancel_operation(
        &self,
        endpoint_url: &str,
        operation_id: &str,
        reason: &str,
    ) -> std::result::Result<(), WorkerCallError>;

    async fn shutdown_notice(
        &self,
        endpoint_url: &str,
        notice: &ShutdownNotice,
    ) -> std::result::Result<(), WorkerCallError>;
}

/// [`WorkerClient`] over HTTP with bounded, backed-off retries.
#[derive(Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpWorkerClient {
    pub fn new(retry: RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(retry.request_timeout)
            .build()
            .map_err(|e| Error::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, retry })
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn url(endpoint_url: &str, path: &str) -> String {
        format!("{}{}", endpoint_url.trim_end_matches('/'), path)
    }

    /// Send a request, retrying transport failures and 5xx answers.
    ///
    /// Returns the first response with a status below 500.
    async fn send<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&B>,
        retries: u32,
        timeout: Duration,
    ) -> std::result::Result<reqwest::Response, WorkerCallError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.client.request(method.clone(), url).timeout(timeout);
            if let Some(body) = body {
                request = request.json(body);
            }

            let details = match request.send().await {
                Ok(response) if !response.status().is_server_error() => return Ok(response),
                Ok(response) => format!("HTTP {}", response.status()),
                Err(e) => e.to_string(),
            };

            if attempt > retries {
                return Err(WorkerCallError::Transport {
                    attempts: attempt,
                    details,
                });
            }

            let delay = self.retry.delay_for(attempt);
            debug!(
                url = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %details,
                "Worker request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> std::result::Result<T, WorkerCallError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerCallError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| WorkerCallError::Decode(e.to_string()))
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn health(&self, endpoint_url: &str) -> std::result::Result<WorkerHealthResponse, WorkerCallError> {
        // Probes are already periodic; one attempt each.
        let url = Self::url(endpoint_url, worker_paths::HEALTH);
        let response = self
            .send::<()>(reqwest::Method::GET, &url, None, 0, self.retry.request_timeout)
            .await?;
        Self::decode(response).await
    }

    async fn start_operation(
        &self,
        endpoint_url: &str,
        request: &StartOperationRequest,
    ) -> std::result::Result<StartOutcome, WorkerCallError> {
        let url = Self::url(endpoint_url, worker_paths::START_OPERATION);
        let response = self
            .send(
                reqwest::Method::POST,
                &url,
                Some(request),
                self.retry.max_retries,
                self.retry.request_timeout,
            )
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(StartOutcome::Busy);
        }
        let accepted: StartOperationResponse = Self::decode(response).await?;
        Ok(if accepted.accepted {
            StartOutcome::Accepted
        } else {
            StartOutcome::Busy
        })
    }

    async fn cancel_operation(
        &self,
        endpoint_url: &str,
        operation_id: &str,
        reason: &str,
    ) -> std::result::Result<(), WorkerCallError> {
        let url = Self::url(endpoint_url, &worker_paths::cancel_operation(operation_id));
        let body = WorkerCancelRequest {
            reason: Some(reason.to_string()),
        };
        let response = self
            .send(
                reqwest::Method::POST,
                &url,
                Some(&body),
                self.retry.max_retries,
                self.retry.request_timeout,
            )
            .await?;
        // 404: the worker no longer runs it, which is what we wanted.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(WorkerCallError::Status {
            status: response.status().as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn shutdown_notice(
        &self,
        endpoint_url: &str,
        notice: &ShutdownNotice,
    ) -> std::result::Result<(), WorkerCallError> {
        let url = Self::url(endpoint_url, worker_paths::SHUTDOWN_NOTICE);
        let timeout = self.retry.request_timeout.min(Duration::from_secs(2));
        let response = self
            .send(reqwest::Method::POST, &url, Some(notice), 0, timeout)
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WorkerCallError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Decision of an [`AdmissionGate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Deny(String),
}

/// Consulted before a worker is selected. Errors block the assignment.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn admit(
        &self,
        operation: &Operation,
        worker_type: &str,
    ) -> std::result::Result<Admission, String>;
}

/// Gate that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitAll;

#[async_trait]
impl AdmissionGate for AdmitAll {
    async fn admit(&self, _operation: &Operation, _worker_type: &str) -> std::result::Result<Admission, String> {
        Ok(Admission::Admit)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// A successful assignment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub operation_id: String,
    pub worker_id: String,
}

/// Assigns pending operations to idle workers.
pub struct Dispatcher {
    ctx: Arc<CoordinatorContext>,
    client: Arc<dyn WorkerClient>,
    gate: Arc<dyn AdmissionGate>,
    in_flight: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<CoordinatorContext>,
        client: Arc<dyn WorkerClient>,
        gate: Arc<dyn AdmissionGate>,
    ) -> Self {
        Self {
            ctx,
            client,
            gate,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn client(&self) -> &Arc<dyn WorkerClient> {
        &self.client
    }

    /// Assign a `pending` operation to an idle healthy worker of `worker_type`.
    pub async fn assign(&self, operation_id: &str, worker_type: &str) -> Result<Assignment> {
        if self.ctx.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        if !self.in_flight.lock().await.insert(operation_id.to_string()) {
            return Err(Error::Core(CoreError::InvalidOperationState {
                operation_id: operation_id.to_string(),
                expected: OperationStatus::Pending.as_str().to_string(),
                actual: "dispatching".to_string(),
            }));
        }
        let result = self.assign_inner(operation_id, worker_type).await;
        self.in_flight.lock().await.remove(operation_id);
        result
    }

    async fn assign_inner(&self, operation_id: &str, worker_type: &str) -> Result<Assignment> {
        let operation = self.ctx.operations.get(operation_id).await?;
        if operation.status != OperationStatus::Pending {
            return Err(Error::Core(CoreError::InvalidOperationState {
                operation_id: operation_id.to_string(),
                expected: OperationStatus::Pending.as_str().to_string(),
                actual: operation.status.as_str().to_string(),
            }));
        }

        match self.gate.admit(&operation, worker_type).await {
            Ok(Admission::Admit) => {}
            Ok(Admission::Deny(reason)) => {
                info!(operation_id = %operation_id, reason = %reason, "Admission denied");
                return Err(Error::AdmissionDenied { reason });
            }
            Err(e) => {
                warn!(operation_id = %operation_id, error = %e, "Admission gate failed, denying");
                return Err(Error::AdmissionDenied {
                    reason: format!("admission gate error: {}", e),
                });
            }
        }

        let Some(worker) = self.ctx.workers.try_reserve(worker_type, operation_id).await else {
            return Err(Error::NoWorkerAvailable {
                worker_type: worker_type.to_string(),
            });
        };

        let request = StartOperationRequest {
            operation_id: operation_id.to_string(),
            operation_type: operation.operation_type.clone(),
            metadata: operation.metadata.clone(),
        };

        match self.client.start_operation(&worker.endpoint_url, &request).await {
            Ok(StartOutcome::Accepted) => {}
            Ok(StartOutcome::Busy) => {
                self.ctx.workers.release(&worker.worker_id, operation_id).await;
                warn!(operation_id = %operation_id, worker_id = %worker.worker_id, "Worker reported busy");
                return Err(Error::WorkerBusy {
                    worker_id: worker.worker_id,
                });
            }
            Err(e) => {
                self.ctx.workers.release(&worker.worker_id, operation_id).await;
                warn!(
                    operation_id = %operation_id,
                    worker_id = %worker.worker_id,
                    error = %e,
                    "Failed to deliver start request"
                );
                return Err(Error::WorkerUnreachable {
                    worker_id: worker.worker_id,
                    details: e.to_string(),
                });
            }
        }

        if let Err(e) = self
            .ctx
            .operations
            .start(operation_id, Some(&worker.worker_id))
            .await
        {
            // Another writer moved the operation first.
            self.ctx.workers.release(&worker.worker_id, operation_id).await;
            if let Err(cancel_err) = self
                .client
                .cancel_operation(&worker.endpoint_url, operation_id, "assignment rolled back")
                .await
            {
                warn!(
                    operation_id = %operation_id,
                    worker_id = %worker.worker_id,
                    error = %cancel_err,
                    "Failed to roll back worker start"
                );
            }
            return Err(e.into());
        }

        info!(
            operation_id = %operation_id,
            worker_id = %worker.worker_id,
            worker_type = %worker_type,
            "Operation dispatched"
        );

        Ok(Assignment {
            operation_id: operation_id.to_string(),
            worker_id: worker.worker_id,
        })
    }

    /// Best-effort cancel request to the workers owning `operation_ids`.
    pub async fn propagate_cancel(&self, operation_ids: &[String], reason: &str) {
        for operation_id in operation_ids {
            let owner = match self.ctx.operations.find(operation_id).await {
                Ok(Some(op)) => op.worker_id,
                Ok(None) => None,
                Err(e) => {
                    warn!(operation_id = %operation_id, error = %e, "Failed to load cancelled operation");
                    None
                }
            };
            self.ctx.workers.clear_operation(operation_id).await;

            let Some(worker_id) = owner else { continue };
            let Some(worker) = self.ctx.workers.get(&worker_id).await else {
                debug!(operation_id = %operation_id, worker_id = %worker_id, "Owner not registered, skipping cancel");
                continue;
            };
            match self
                .client
                .cancel_operation(&worker.endpoint_url, operation_id, reason)
                .await
            {
                Ok(()) => debug!(operation_id = %operation_id, worker_id = %worker_id, "Cancel delivered to worker"),
                Err(e) => warn!(
                    operation_id = %operation_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Failed to deliver cancel to worker"
                ),
            }
        }
    }
}
