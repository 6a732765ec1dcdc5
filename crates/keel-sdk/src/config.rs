// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK configuration for connecting a worker to keel-coordinator.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use keel_core::CheckpointPolicies;

use crate::error::{Result, SdkError};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Worker ID (required) - stable across restarts of the same worker
    pub worker_id: String,
    /// Worker type (required) - operations are dispatched by type
    pub worker_type: String,
    /// Coordinator base URL (required), e.g. `http://10.0.0.2:8080`
    pub backend_url: String,
    /// URL the coordinator uses to reach this worker. Derived from the bound
    /// address when unset.
    pub endpoint_url: Option<String>,
    /// Address the worker endpoints listen on (default: 0.0.0.0:9000)
    pub bind_addr: SocketAddr,
    /// Heartbeat interval in milliseconds (default: 5_000)
    pub heartbeat_interval_ms: u64,
    /// Request timeout in milliseconds (default: 10_000)
    pub request_timeout_ms: u64,
    /// Retries after the first attempt of a coordinator call (default: 3)
    pub max_retries: u32,
    /// Periodic re-registration interval in milliseconds (default: 30_000)
    pub reregister_interval_ms: u64,
    /// Poll interval while the coordinator is away, in milliseconds (default: 1_000)
    pub backend_poll_interval_ms: u64,
    /// Time budget for the shutdown checkpoint, in milliseconds (default: 25_000)
    pub shutdown_grace_ms: u64,
    /// Checkpoint cadence per operation type
    pub checkpoint_policies: CheckpointPolicies,
}

impl SdkConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `KEEL_WORKER_ID`
    /// - `KEEL_WORKER_TYPE`
    /// - `KEEL_BACKEND_URL`
    ///
    /// # Optional Environment Variables
    /// - `KEEL_WORKER_ENDPOINT_URL` - Endpoint advertised to the coordinator
    /// - `KEEL_WORKER_BIND_ADDR` - Listen address (default: 0.0.0.0:9000)
    /// - `KEEL_HEARTBEAT_INTERVAL_MS` - Heartbeat interval (default: 5000)
    /// - `KEEL_REQUEST_TIMEOUT_MS` - Request timeout (default: 10000)
    /// - `KEEL_MAX_RETRIES` - Retries per coordinator call (default: 3)
    /// - `KEEL_REREGISTER_INTERVAL_MS` - Periodic re-registration (default: 30000)
    /// - `KEEL_BACKEND_POLL_INTERVAL_MS` - Poll while the coordinator is away (default: 1000)
    /// - `KEEL_WORKER_SHUTDOWN_GRACE_MS` - Shutdown budget (default: 25000)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SdkError::Config(format!("{} is required", name)))
        };

        let defaults = Self::new(
            required("KEEL_WORKER_ID")?,
            required("KEEL_WORKER_TYPE")?,
            required("KEEL_BACKEND_URL")?,
        );

        Ok(Self {
            endpoint_url: lookup("KEEL_WORKER_ENDPOINT_URL").filter(|v| !v.is_empty()),
            bind_addr: parse_var(&lookup, "KEEL_WORKER_BIND_ADDR", defaults.bind_addr)?,
            heartbeat_interval_ms: parse_var(
                &lookup,
                "KEEL_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            request_timeout_ms: parse_var(&lookup, "KEEL_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            max_retries: parse_var(&lookup, "KEEL_MAX_RETRIES", defaults.max_retries)?,
            reregister_interval_ms: parse_var(
                &lookup,
                "KEEL_REREGISTER_INTERVAL_MS",
                defaults.reregister_interval_ms,
            )?,
            backend_poll_interval_ms: parse_var(
                &lookup,
                "KEEL_BACKEND_POLL_INTERVAL_MS",
                defaults.backend_poll_interval_ms,
            )?,
            shutdown_grace_ms: parse_var(&lookup, "KEEL_WORKER_SHUTDOWN_GRACE_MS", defaults.shutdown_grace_ms)?,
            ..defaults
        })
    }

    /// Create a new configuration with defaults for everything optional.
    pub fn new(
        worker_id: impl Into<String>,
        worker_type: impl Into<String>,
        backend_url: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_type: worker_type.into(),
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
            endpoint_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            heartbeat_interval_ms: 5_000,
            request_timeout_ms: 10_000,
            max_retries: 3,
            reregister_interval_ms: 30_000,
            backend_poll_interval_ms: 1_000,
            shutdown_grace_ms: 25_000,
            checkpoint_policies: CheckpointPolicies::default(),
        }
    }

    /// Set the advertised endpoint URL.
    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Set the listen address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_reregister_interval_ms(mut self, interval_ms: u64) -> Self {
        self.reregister_interval_ms = interval_ms;
        self
    }

    pub fn with_backend_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.backend_poll_interval_ms = interval_ms;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, grace_ms: u64) -> Self {
        self.shutdown_grace_ms = grace_ms;
        self
    }

    pub fn with_checkpoint_policies(mut self, policies: CheckpointPolicies) -> Self {
        self.checkpoint_policies = policies;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reregister_interval(&self) -> Duration {
        Duration::from_millis(self.reregister_interval_ms)
    }

    pub fn backend_poll_interval(&self) -> Duration {
        Duration::from_millis(self.backend_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .parse()
            .map_err(|_| SdkError::Config(format!("invalid {}: {}", name, value))),
        None => Ok(default),
    }
}
