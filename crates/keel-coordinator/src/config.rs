// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for keel-coordinator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use keel_core::CheckpointPolicy;

use crate::checkpoint_cleanup_worker::CheckpointCleanupConfig;
use crate::dispatcher::RetryConfig;

/// Coordinator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://...` or `sqlite:...`
    pub database_url: String,
    /// HTTP API address
    pub http_addr: SocketAddr,
    /// Data directory for the lock file and checkpoint artifacts
    pub data_dir: PathBuf,
    /// Running operations silent for longer than this are demoted
    pub staleness_threshold: Duration,
    /// How often workers are probed and stale operations swept
    pub health_check_interval: Duration,
    /// Consecutive failed probes before a worker is unhealthy
    pub max_missed_probes: u32,
    /// How long a demoted operation waits for its worker before failing
    pub orphan_grace: Duration,
    /// Time budget for draining in-flight work on shutdown
    pub shutdown_grace: Duration,
    /// Coordinator -> worker request behaviour
    pub worker_retry: RetryConfig,
    /// Default checkpoint policy
    pub checkpoint_policy: CheckpointPolicy,
    /// Checkpoint cleanup schedule and disk alert threshold
    pub cleanup: CheckpointCleanupConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("KEEL_DATABASE_URL").ok_or(ConfigError::MissingEnvVar("KEEL_DATABASE_URL"))?;

        let port: u16 = parse_var(&lookup, "KEEL_HTTP_PORT", 8080)?;
        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let data_dir = PathBuf::from(lookup("KEEL_DATA_DIR").unwrap_or_else(|| ".data".to_string()));

        let health_check_interval =
            Duration::from_secs(parse_positive(&lookup, "KEEL_HEALTH_CHECK_INTERVAL_SECS", 30)?);
        let orphan_grace = match lookup("KEEL_ORPHAN_GRACE_SECS") {
            Some(_) => Duration::from_secs(parse_var(&lookup, "KEEL_ORPHAN_GRACE_SECS", 0)?),
            None => health_check_interval * 2,
        };

        let worker_retry = RetryConfig {
            max_retries: parse_var(&lookup, "KEEL_WORKER_MAX_RETRIES", 3)?,
            request_timeout: Duration::from_millis(parse_var(
                &lookup,
                "KEEL_WORKER_REQUEST_TIMEOUT_MS",
                10_000,
            )?),
            ..RetryConfig::default()
        };

        let checkpoint_policy = CheckpointPolicy {
            checkpoint_interval: Duration::from_secs(parse_var(
                &lookup,
                "KEEL_CHECKPOINT_INTERVAL_SECS",
                300,
            )?),
            force_checkpoint_every_n: parse_var(&lookup, "KEEL_CHECKPOINT_FORCE_EVERY_N", 50)?,
            delete_on_completion: parse_bool(&lookup, "KEEL_CHECKPOINT_DELETE_ON_COMPLETION", true)?,
            checkpoint_on_failure: parse_bool(&lookup, "KEEL_CHECKPOINT_ON_FAILURE", true)?,
        };

        let cleanup_hours: u64 = parse_positive(&lookup, "KEEL_CHECKPOINT_CLEANUP_INTERVAL_HOURS", 24)?;
        let max_age_days: u64 = parse_var(&lookup, "KEEL_CHECKPOINT_MAX_AGE_DAYS", 30)?;
        let cleanup = CheckpointCleanupConfig {
            poll_interval: Duration::from_secs(cleanup_hours * 3600),
            max_age: Duration::from_secs(max_age_days * 24 * 3600),
            warn_disk_usage_percent: parse_var(&lookup, "KEEL_CHECKPOINT_WARN_DISK_PERCENT", 80.0)?,
            ..CheckpointCleanupConfig::default()
        };

        Ok(Self {
            database_url,
            http_addr,
            data_dir,
            staleness_threshold: Duration::from_secs(parse_positive(
                &lookup,
                "KEEL_STALENESS_THRESHOLD_SECS",
                120,
            )?),
            health_check_interval,
            max_missed_probes: parse_positive(&lookup, "KEEL_MAX_MISSED_PROBES", 3)?,
            orphan_grace,
            shutdown_grace: Duration::from_secs(parse_var(&lookup, "KEEL_SHUTDOWN_GRACE_SECS", 25)?),
            worker_retry,
            checkpoint_policy,
            cleanup,
        })
    }

    /// Directory holding published checkpoint artifacts.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Marker file guarding the data directory against a second coordinator.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("keel-coordinator.lock")
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

/// [`parse_var`] for values where zero would stall or spin a loop.
fn parse_positive<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    let value = parse_var(lookup, name, default)?;
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            name,
            value: lookup(name).unwrap_or_default(),
        })
    }
}

fn parse_bool<F>(lookup: &F, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).as_deref().map(str::trim) {
        None => Ok(default),
        Some("true" | "1") => Ok(true),
        Some("false" | "0") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            name,
            value: other.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[("KEEL_DATABASE_URL", "sqlite:keel.db")])).unwrap();
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.data_dir, PathBuf::from(".data"));
        assert_eq!(config.staleness_threshold, Duration::from_secs(120));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.max_missed_probes, 3);
        assert_eq!(config.orphan_grace, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_secs(25));
        assert_eq!(config.worker_retry.max_retries, 3);
        assert_eq!(config.worker_retry.request_timeout, Duration::from_secs(10));
        assert_eq!(config.checkpoint_policy, CheckpointPolicy::default());
        assert_eq!(config.cleanup.poll_interval, Duration::from_secs(24 * 3600));
        assert_eq!(config.cleanup.max_age, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.cleanup.warn_disk_usage_percent, 80.0);
        assert_eq!(config.lock_path(), PathBuf::from(".data/keel-coordinator.lock"));
    }

    #[test]
    fn test_orphan_grace_follows_health_interval() {
        let config = Config::from_lookup(lookup_from(&[
            ("KEEL_DATABASE_URL", "sqlite:keel.db"),
            ("KEEL_HEALTH_CHECK_INTERVAL_SECS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.orphan_grace, Duration::from_secs(20));

        let config = Config::from_lookup(lookup_from(&[
            ("KEEL_DATABASE_URL", "sqlite:keel.db"),
            ("KEEL_HEALTH_CHECK_INTERVAL_SECS", "10"),
            ("KEEL_ORPHAN_GRACE_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.orphan_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_database_url() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("KEEL_DATABASE_URL")));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup_from(&[
            ("KEEL_DATABASE_URL", "sqlite:keel.db"),
            ("KEEL_HTTP_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "KEEL_HTTP_PORT", .. }));

        let err = Config::from_lookup(lookup_from(&[
            ("KEEL_DATABASE_URL", "sqlite:keel.db"),
            ("KEEL_CHECKPOINT_ON_FAILURE", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for name in [
            "KEEL_HEALTH_CHECK_INTERVAL_SECS",
            "KEEL_STALENESS_THRESHOLD_SECS",
            "KEEL_MAX_MISSED_PROBES",
            "KEEL_CHECKPOINT_CLEANUP_INTERVAL_HOURS",
        ] {
            let err = Config::from_lookup(lookup_from(&[
                ("KEEL_DATABASE_URL", "sqlite:keel.db"),
                (name, "0"),
            ]))
            .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { name: n, .. } if n == name),
                "{}: {:?}",
                name,
                err
            );
        }
    }

    #[test]
    fn test_checkpoint_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("KEEL_DATABASE_URL", "postgres://localhost/keel"),
            ("KEEL_CHECKPOINT_INTERVAL_SECS", "60"),
            ("KEEL_CHECKPOINT_FORCE_EVERY_N", "0"),
            ("KEEL_CHECKPOINT_DELETE_ON_COMPLETION", "false"),
        ]))
        .unwrap();
        assert_eq!(config.checkpoint_policy.checkpoint_interval, Duration::from_secs(60));
        assert_eq!(config.checkpoint_policy.force_checkpoint_every_n, 0);
        assert!(!config.checkpoint_policy.delete_on_completion);
        assert!(config.checkpoint_policy.checkpoint_on_failure);
    }
}
