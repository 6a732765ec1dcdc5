// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint store and checkpoint policy engine.
//!
//! Each operation has at most one checkpoint; saving replaces it. Artifact
//! files are written into a staging directory and renamed into place before
//! the checkpoint row references them, so a reader never observes a
//! half-written artifact set.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::persistence::{CheckpointRecord, CheckpointRow, Persistence};
use crate::types::{CheckpointType, Document};

/// Name of the staging directory under the artifacts root.
const STAGING_DIR: &str = ".staging";

// ============================================================================
// Policy
// ============================================================================

/// When to take checkpoints and what to do with them at the end of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    /// Time trigger. Zero disables it.
    #[serde(with = "duration_secs")]
    pub checkpoint_interval: Duration,
    /// Unit trigger: checkpoint whenever the unit counter crosses a multiple
    /// of this value. Zero disables it.
    pub force_checkpoint_every_n: u64,
    /// Delete the checkpoint once the operation completes.
    pub delete_on_completion: bool,
    /// Save a `failure` snapshot before marking the operation failed.
    pub checkpoint_on_failure: bool,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(300),
            force_checkpoint_every_n: 50,
            delete_on_completion: true,
            checkpoint_on_failure: true,
        }
    }
}

impl CheckpointPolicy {
    /// Decide whether a checkpoint is due.
    ///
    /// `last_units` is the unit counter at the previous checkpoint and
    /// `units` the current counter.
    pub fn should_checkpoint(&self, elapsed: Duration, last_units: u64, units: u64) -> bool {
        let time_due = !self.checkpoint_interval.is_zero() && elapsed >= self.checkpoint_interval;
        let units_due = self.force_checkpoint_every_n > 0
            && units / self.force_checkpoint_every_n > last_units / self.force_checkpoint_every_n;
        time_due || units_due
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Per-operation-type policies with a fallback default.
#[derive(Debug, Clone, Default)]
pub struct CheckpointPolicies {
    default: CheckpointPolicy,
    per_type: HashMap<String, CheckpointPolicy>,
}

impl CheckpointPolicies {
    /// Policies that use `default` for every type.
    pub fn new(default: CheckpointPolicy) -> Self {
        Self {
            default,
            per_type: HashMap::new(),
        }
    }

    /// Override the policy for one operation type.
    pub fn with_policy(mut self, operation_type: impl Into<String>, policy: CheckpointPolicy) -> Self {
        self.per_type.insert(operation_type.into(), policy);
        self
    }

    /// Policy for `operation_type`, or the default.
    pub fn for_type(&self, operation_type: &str) -> &CheckpointPolicy {
        self.per_type.get(operation_type).unwrap_or(&self.default)
    }

    /// The fallback policy.
    pub fn default_policy(&self) -> &CheckpointPolicy {
        &self.default
    }
}

/// Tracks the time and unit counter of the last checkpoint for one running job.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    policy: CheckpointPolicy,
    last_at: Instant,
    last_units: u64,
}

impl CheckpointTracker {
    /// Start tracking; the time trigger counts from `started`.
    pub fn new(policy: CheckpointPolicy, started: Instant) -> Self {
        Self {
            policy,
            last_at: started,
            last_units: 0,
        }
    }

    /// Whether a checkpoint is due at `now` with the counter at `units`.
    pub fn is_due(&self, now: Instant, units: u64) -> bool {
        self.policy
            .should_checkpoint(now.saturating_duration_since(self.last_at), self.last_units, units)
    }

    /// Record that a checkpoint was taken.
    pub fn mark(&mut self, now: Instant, units: u64) {
        self.last_at = now;
        self.last_units = units;
    }

    /// The policy being applied.
    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }
}

// ============================================================================
// Artifacts
// ============================================================================

/// Filesystem store for checkpoint artifacts.
///
/// Layout: `{root}/.staging/<uuid>/` while writing, `{root}/<operation_id>/<uuid>/`
/// once published.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Store rooted at `root` (created lazily). A relative root is resolved
    /// against the current directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    /// The artifacts root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `files` and publish them atomically for `operation_id`.
    ///
    /// Returns the published directory.
    pub async fn publish(
        &self,
        operation_id: &str,
        files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<PathBuf> {
        validate_path_segment("operation_id", operation_id)?;
        for name in files.keys() {
            validate_relative_name(name)?;
        }

        let set_id = Uuid::new_v4().simple().to_string();
        let staging = self.root.join(STAGING_DIR).join(&set_id);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| CoreError::io(&staging, e))?;

        if let Err(err) = write_files(&staging, files).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        let operation_dir = self.root.join(operation_id);
        tokio::fs::create_dir_all(&operation_dir)
            .await
            .map_err(|e| CoreError::io(&operation_dir, e))?;

        let published = operation_dir.join(&set_id);
        if let Err(e) = tokio::fs::rename(&staging, &published).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(CoreError::io(&published, e));
        }

        debug!(
            operation_id = %operation_id,
            path = %published.display(),
            files = files.len(),
            "Published checkpoint artifacts"
        );
        Ok(published)
    }

    /// Resolve a caller-supplied artifacts directory, which must lie strictly
    /// inside the store root. Relative paths are taken from the root.
    pub fn contain(&self, path: &Path) -> Result<PathBuf> {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(CoreError::validation(
                "artifacts_path",
                "must not contain '..' components",
            ));
        }
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let outside = || {
            CoreError::validation(
                "artifacts_path",
                format!("must be a directory inside {}", self.root.display()),
            )
        };
        if !candidate.starts_with(&self.root) || candidate == self.root {
            return Err(outside());
        }

        // Symlinks inside the root may still point elsewhere.
        if let Ok(resolved) = std::fs::canonicalize(&candidate) {
            let root = std::fs::canonicalize(&self.root).map_err(|e| CoreError::io(&self.root, e))?;
            if !resolved.starts_with(&root) || resolved == root {
                return Err(outside());
            }
        }
        Ok(candidate)
    }

    /// Read every file under `dir`, keyed by `/`-separated relative name.
    pub async fn read_all(&self, dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || read_dir_recursive(&dir))
            .await
            .map_err(|e| CoreError::IoError {
                path: "artifacts".to_string(),
                details: e.to_string(),
            })?
    }

    /// Remove a published artifact directory.
    ///
    /// Paths outside the root are left alone; a missing directory is not an error.
    pub async fn remove(&self, dir: &Path) -> Result<bool> {
        if !dir.starts_with(&self.root) || dir == self.root {
            debug!(path = %dir.display(), "Skipping removal of artifacts outside the store root");
            return Ok(false);
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                if let Some(parent) = dir.parent()
                    && parent != self.root
                {
                    // Drop the per-operation directory once it is empty.
                    let _ = tokio::fs::remove_dir(parent).await;
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::io(dir, e)),
        }
    }
}

async fn write_files(dir: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    for (name, bytes) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::io(parent, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CoreError::io(&path, e))?;
    }
    Ok(())
}

fn read_dir_recursive(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| CoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io(&dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| CoreError::io(&path, e))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let bytes = std::fs::read(&path).map_err(|e| CoreError::io(&path, e))?;
                let name = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.insert(name, bytes);
            }
        }
    }
    Ok(files)
}

/// Recursive size of a file or directory in bytes.
pub fn path_size(path: &Path) -> std::io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += path_size(&entry?.path())?;
    }
    Ok(total)
}

pub(crate) fn validate_path_segment(field: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(CoreError::validation(
            field,
            format!("'{}' is not a safe path segment", value),
        ))
    }
}

fn validate_relative_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(CoreError::validation(
            "artifacts",
            format!("artifact name '{}' must be a relative path", name),
        ))
    }
}

// ============================================================================
// Store
// ============================================================================

/// Metadata of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub operation_id: String,
    pub checkpoint_type: CheckpointType,
    pub created_at: DateTime<Utc>,
    pub artifacts_path: Option<String>,
    pub state_size_bytes: Option<i32>,
    pub artifacts_size_bytes: Option<i64>,
}

/// A checkpoint read back for resumption.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedCheckpoint {
    pub info: CheckpointInfo,
    pub state: Document,
    /// Artifact contents by relative name, when requested.
    pub artifacts: Option<BTreeMap<String, Vec<u8>>>,
}

impl TryFrom<CheckpointRecord> for LoadedCheckpoint {
    type Error = CoreError;

    fn try_from(record: CheckpointRecord) -> Result<Self> {
        let checkpoint_type: CheckpointType =
            record
                .checkpoint_type
                .parse()
                .map_err(|e: crate::types::ParseEnumError| CoreError::DatabaseError {
                    operation: "decode_checkpoint".to_string(),
                    details: e.to_string(),
                })?;
        let state = Document::from_value(record.state.0).map_err(|e| CoreError::DatabaseError {
            operation: "decode_checkpoint".to_string(),
            details: e.to_string(),
        })?;
        Ok(Self {
            info: CheckpointInfo {
                operation_id: record.operation_id,
                checkpoint_type,
                created_at: record.created_at,
                artifacts_path: record.artifacts_path,
                state_size_bytes: record.state_size_bytes,
                artifacts_size_bytes: record.artifacts_size_bytes,
            },
            state,
            artifacts: None,
        })
    }
}

/// Persists and retrieves the single resumable checkpoint of each operation.
#[derive(Clone)]
pub struct CheckpointStore {
    persistence: Arc<dyn Persistence>,
    artifacts: ArtifactStore,
    policies: CheckpointPolicies,
}

impl CheckpointStore {
    /// Create a store over `persistence` with artifacts under `artifacts`.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        artifacts: ArtifactStore,
        policies: CheckpointPolicies,
    ) -> Self {
        Self {
            persistence,
            artifacts,
            policies,
        }
    }

    /// Checkpoint policies by operation type.
    pub fn policies(&self) -> &CheckpointPolicies {
        &self.policies
    }

    /// The artifact filesystem store.
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Insert or replace the operation's checkpoint.
    ///
    /// `artifacts_path` should point at a directory already published via
    /// [`ArtifactStore::publish`]; anything outside the store root is
    /// rejected with a validation error. When the replaced checkpoint
    /// referenced a different directory, that directory is removed after the
    /// row is updated.
    pub async fn save_checkpoint(
        &self,
        operation_id: &str,
        checkpoint_type: CheckpointType,
        state: &Document,
        artifacts_path: Option<&Path>,
    ) -> Result<CheckpointInfo> {
        if self.persistence.get_operation(operation_id).await?.is_none() {
            return Err(CoreError::OperationNotFound {
                operation_id: operation_id.to_string(),
            });
        }

        let artifacts_path = artifacts_path
            .map(|path| self.artifacts.contain(path))
            .transpose()?;
        let artifacts_path = artifacts_path.as_deref();

        let state_size_bytes =
            i32::try_from(state.serialized_len()).map_err(|_| CoreError::CheckpointSaveFailed {
                operation_id: operation_id.to_string(),
                reason: "state too large".to_string(),
            })?;

        let artifacts_size_bytes = match artifacts_path {
            Some(path) if path.exists() => {
                let owned = path.to_path_buf();
                let size = tokio::task::spawn_blocking(move || path_size(&owned))
                    .await
                    .map_err(|e| CoreError::IoError {
                        path: path.display().to_string(),
                        details: e.to_string(),
                    })?
                    .map_err(|e| CoreError::io(path, e))?;
                Some(i64::try_from(size).unwrap_or(i64::MAX))
            }
            _ => None,
        };

        let path_string = artifacts_path.map(|p| p.to_string_lossy().into_owned());
        let state_value = state.to_value();
        let created_at = Utc::now();

        let previous = self
            .persistence
            .upsert_checkpoint(&CheckpointRow {
                operation_id,
                checkpoint_type: checkpoint_type.as_str(),
                state: &state_value,
                artifacts_path: path_string.as_deref(),
                state_size_bytes,
                artifacts_size_bytes,
                created_at,
            })
            .await?;

        if let Some(previous) = previous
            && let Err(e) = self.artifacts.remove(Path::new(&previous)).await
        {
            warn!(
                operation_id = %operation_id,
                path = %previous,
                error = %e,
                "Failed to remove replaced checkpoint artifacts"
            );
        }

        debug!(
            operation_id = %operation_id,
            checkpoint_type = %checkpoint_type,
            state_size_bytes,
            "Checkpoint saved"
        );

        Ok(CheckpointInfo {
            operation_id: operation_id.to_string(),
            checkpoint_type,
            created_at,
            artifacts_path: path_string,
            state_size_bytes: Some(state_size_bytes),
            artifacts_size_bytes,
        })
    }

    /// Publish artifact files and save the checkpoint referencing them.
    pub async fn save_checkpoint_with_artifacts(
        &self,
        operation_id: &str,
        checkpoint_type: CheckpointType,
        state: &Document,
        files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<CheckpointInfo> {
        let published = self.artifacts.publish(operation_id, files).await?;
        match self
            .save_checkpoint(operation_id, checkpoint_type, state, Some(&published))
            .await
        {
            Ok(info) => Ok(info),
            Err(e) => {
                let _ = self.artifacts.remove(&published).await;
                Err(e)
            }
        }
    }

    /// Load the operation's checkpoint, or `None` when it has none.
    pub async fn load_checkpoint(
        &self,
        operation_id: &str,
        load_artifacts: bool,
    ) -> Result<Option<LoadedCheckpoint>> {
        let Some(record) = self.persistence.get_checkpoint(operation_id).await? else {
            return Ok(None);
        };
        let mut loaded = LoadedCheckpoint::try_from(record)?;

        if load_artifacts && let Some(path) = loaded.info.artifacts_path.as_deref() {
            let path = Path::new(path);
            if let Err(e) = self.artifacts.contain(path) {
                warn!(
                    operation_id = %operation_id,
                    path = %path.display(),
                    error = %e,
                    "Refusing to read checkpoint artifacts outside the store root"
                );
                loaded.artifacts = Some(BTreeMap::new());
            } else if path.is_dir() {
                loaded.artifacts = Some(self.artifacts.read_all(path).await?);
            } else {
                warn!(
                    operation_id = %operation_id,
                    path = %path.display(),
                    "Checkpoint artifacts directory is missing"
                );
                loaded.artifacts = Some(BTreeMap::new());
            }
        }

        Ok(Some(loaded))
    }

    /// Delete the operation's checkpoint and its artifacts. Returns whether one existed.
    pub async fn delete_checkpoint(&self, operation_id: &str) -> Result<bool> {
        let Some(record) = self.persistence.delete_checkpoint(operation_id).await? else {
            return Ok(false);
        };
        self.remove_artifacts(&record).await;
        Ok(true)
    }

    /// Delete checkpoints older than `max_age`, in batches of `batch_size`
    /// (at least one).
    ///
    /// Returns the number of checkpoints deleted.
    pub async fn delete_older_than(&self, max_age: chrono::Duration, batch_size: i64) -> Result<usize> {
        let batch_size = batch_size.max(1);
        let cutoff = Utc::now() - max_age;
        let mut total = 0;
        loop {
            let deleted = self
                .persistence
                .delete_checkpoints_older_than(cutoff, batch_size)
                .await?;
            let count = deleted.len();
            for record in &deleted {
                self.remove_artifacts(record).await;
            }
            total += count;
            if (count as i64) < batch_size {
                break;
            }
        }
        if total > 0 {
            info!(deleted = total, cutoff = %cutoff, "Deleted expired checkpoints");
        }
        Ok(total)
    }

    async fn remove_artifacts(&self, record: &CheckpointRecord) {
        if let Some(path) = record.artifacts_path.as_deref()
            && let Err(e) = self.artifacts.remove(Path::new(path)).await
        {
            warn!(
                operation_id = %record.operation_id,
                path = %path,
                error = %e,
                "Failed to remove checkpoint artifacts"
            );
        }
    }
}
