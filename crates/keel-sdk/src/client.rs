// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for worker -> coordinator calls.
//!
//! Every call is bounded: a per-request timeout and at most
//! `max_retries` retries with exponential backoff. Connection failures and
//! 5xx answers are retried; any other answer is returned as-is.

use std::collections::BTreeMap;
use std::time::Duration;

use keel_core::protocol::{
    API_PREFIX, CheckpointResponse, CompleteRequest, ErrorBody, FailRequest, HeartbeatAck,
    HeartbeatRequest, RegisterWorkerRequest, RegisterWorkerResponse, SaveCheckpointRequest,
    decode_artifacts, encode_artifacts,
};
use keel_core::{CheckpointInfo, CheckpointType, Document, LoadedCheckpoint, Operation};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::config::SdkConfig;
use crate::error::{Result, SdkError};

/// Delay before the first retry; doubles per retry.
const BASE_RETRY_DELAY: Duration = Duration::from_millis(200);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Client for the coordinator API.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    worker_id: String,
    max_retries: u32,
}

impl BackendClient {
    pub fn new(config: &SdkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SdkError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            worker_id: config.worker_id.clone(),
            max_retries: config.max_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    fn retry_delay(attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        BASE_RETRY_DELAY.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        retries: u32,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.http.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let details = match request.send().await {
                Ok(response) if !response.status().is_server_error() => return Ok(response),
                // The coordinator is draining; retrying against it is pointless.
                Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
                    return Ok(response);
                }
                Ok(response) => format!("HTTP {}", response.status()),
                Err(e) => e.to_string(),
            };

            if attempt > retries {
                return Err(SdkError::Transport {
                    attempts: attempt,
                    details,
                });
            }

            let delay = Self::retry_delay(attempt);
            debug!(
                url = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %details,
                "Coordinator request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn call<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = self.url(path);
        let response = self.send(method, &url, body, self.max_retries).await?;
        decode(response).await
    }

    /// Register this worker and reconcile what it reports.
    #[instrument(skip(self, request), fields(worker_id = %request.worker_id))]
    pub async fn register(&self, request: &RegisterWorkerRequest) -> Result<RegisterWorkerResponse> {
        self.call(Method::POST, "/workers/register", Some(request)).await
    }

    /// Record a heartbeat with optional progress.
    pub async fn heartbeat(
        &self,
        operation_id: &str,
        progress_percent: Option<f64>,
        progress_message: Option<String>,
    ) -> Result<HeartbeatAck> {
        let body = HeartbeatRequest {
            worker_id: Some(self.worker_id.clone()),
            progress_percent,
            progress_message,
        };
        self.call(
            Method::POST,
            &format!("/operations/{}/heartbeat", operation_id),
            Some(&body),
        )
        .await
    }

    #[instrument(skip(self, result))]
    pub async fn complete(&self, operation_id: &str, result: Option<Document>) -> Result<Operation> {
        let body = CompleteRequest {
            worker_id: Some(self.worker_id.clone()),
            result,
        };
        self.call(
            Method::POST,
            &format!("/operations/{}/complete", operation_id),
            Some(&body),
        )
        .await
    }

    #[instrument(skip(self, failure_state))]
    pub async fn fail(
        &self,
        operation_id: &str,
        error_message: &str,
        failure_state: Option<Document>,
    ) -> Result<Operation> {
        let body = FailRequest {
            worker_id: Some(self.worker_id.clone()),
            error_message: error_message.to_string(),
            failure_state,
        };
        self.call(
            Method::POST,
            &format!("/operations/{}/fail", operation_id),
            Some(&body),
        )
        .await
    }

    /// Cancel an operation through the coordinator.
    pub async fn cancel(&self, operation_id: &str, reason: &str) -> Result<()> {
        let body = keel_core::protocol::CancelRequest {
            reason: Some(reason.to_string()),
        };
        let _: serde_json::Value = self
            .call(
                Method::POST,
                &format!("/operations/{}/cancel", operation_id),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    /// Save the operation's checkpoint, uploading artifact files when given.
    #[instrument(skip(self, state, artifacts))]
    pub async fn save_checkpoint(
        &self,
        operation_id: &str,
        checkpoint_type: CheckpointType,
        state: &Document,
        artifacts: Option<&BTreeMap<String, Vec<u8>>>,
    ) -> Result<CheckpointInfo> {
        let body = SaveCheckpointRequest {
            checkpoint_type,
            state: state.clone(),
            artifacts_path: None,
            artifacts: artifacts.map(encode_artifacts),
        };
        self.call(
            Method::PUT,
            &format!("/operations/{}/checkpoint", operation_id),
            Some(&body),
        )
        .await
    }

    /// Load the operation's checkpoint; `None` when there is none.
    pub async fn load_checkpoint(&self, operation_id: &str, load_artifacts: bool) -> Result<Option<LoadedCheckpoint>> {
        let path = format!(
            "/operations/{}/checkpoint?load_artifacts={}",
            operation_id, load_artifacts
        );
        let response: CheckpointResponse = match self.call::<(), _>(Method::GET, &path, None).await {
            Ok(response) => response,
            Err(e) if e.code() == Some("CHECKPOINT_NOT_FOUND") => return Ok(None),
            Err(e) => return Err(e),
        };
        let artifacts = match response.artifacts {
            Some(encoded) => Some(decode_artifacts(&encoded)?),
            None => None,
        };
        Ok(Some(LoadedCheckpoint {
            info: response.info,
            state: response.state,
            artifacts,
        }))
    }

    /// Probe the coordinator's root health endpoint once.
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.send::<()>(Method::GET, &url, None, 0).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| SdkError::Serialization(e.to_string()));
    }

    let text = response.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => SdkError::Server {
            status: status.as_u16(),
            code: body.code,
            message: body.message,
            retryable: body.retryable,
        },
        Err(_) => SdkError::Server {
            status: status.as_u16(),
            code: format!("HTTP_{}", status.as_u16()),
            message: text,
            retryable: status.is_server_error(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        assert_eq!(BackendClient::retry_delay(1), Duration::from_millis(200));
        assert_eq!(BackendClient::retry_delay(2), Duration::from_millis(400));
        assert_eq!(BackendClient::retry_delay(3), Duration::from_millis(800));
        assert_eq!(BackendClient::retry_delay(20), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_urls() {
        let config = SdkConfig::new("w", "training", "http://coordinator:8080/");
        let client = BackendClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "http://coordinator:8080");
        assert_eq!(
            client.url("/workers/register"),
            "http://coordinator:8080/api/v1/workers/register"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_exhausts_retries() {
        // Port 9 (discard) on loopback is closed in test environments.
        let config = SdkConfig::new("w", "training", "http://127.0.0.1:9")
            .with_max_retries(1)
            .with_request_timeout_ms(500);
        let client = BackendClient::new(&config).unwrap();
        let err = client
            .heartbeat("op_1", Some(10.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Transport { attempts: 2, .. }), "{:?}", err);
        assert!(!client.is_reachable().await);
    }
}
