// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host-local exclusive execution lock.
//!
//! A marker file records the holder's pid. Acquisition publishes a fully
//! written marker with a hard link, which fails if the marker already exists,
//! so another process never observes a half-written marker. A marker left
//! behind by a dead process is replaced only after re-reading it under an
//! advisory reaper lock; a live holder is reported as [`LockError::Held`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Attempts at replacing a stale marker before giving up.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Non-destructive check whether a process is running.
pub trait ProcessLiveness: Send + Sync {
    /// `true` if a process with `pid` exists.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Signal-0 probe via `kill(2)`.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessLiveness;

#[cfg(unix)]
impl ProcessLiveness for UnixProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to another user.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Process-table lookup via `sysinfo`; works on every platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoProcessLiveness;

impl ProcessLiveness for SysinfoProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        system.process(Pid::from_u32(pid)).is_some()
    }
}

/// The platform's preferred liveness probe.
pub fn default_liveness() -> Arc<dyn ProcessLiveness> {
    #[cfg(unix)]
    {
        Arc::new(UnixProcessLiveness)
    }
    #[cfg(not(unix))]
    {
        Arc::new(SysinfoProcessLiveness)
    }
}

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Lock acquisition failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {path} is held by running process {pid}")]
    Held { pid: u32, path: PathBuf },

    #[error("lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Mutual exclusion between processes on one host.
#[derive(Clone)]
pub struct ExclusiveLock {
    path: PathBuf,
    pid: u32,
    liveness: Arc<dyn ProcessLiveness>,
}

impl std::fmt::Debug for ExclusiveLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveLock")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ExclusiveLock {
    /// Lock backed by the marker at `path`, held on behalf of this process.
    pub fn new(path: impl Into<PathBuf>, liveness: Arc<dyn ProcessLiveness>) -> Self {
        Self {
            path: path.into(),
            pid: std::process::id(),
            liveness,
        }
    }

    /// Same as [`new`](Self::new) with the platform's default liveness probe.
    pub fn with_default_liveness(path: impl Into<PathBuf>) -> Self {
        Self::new(path, default_liveness())
    }

    #[cfg(test)]
    fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Marker path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current marker contents, if any and readable.
    pub fn holder(&self) -> Result<Option<LockMarker>, LockError> {
        Ok(self
            .read_raw()?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    /// Acquire the lock, replacing a marker whose holder is no longer running.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;
        }

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match self.try_publish() {
                Ok(()) => {
                    info!(path = %self.path.display(), pid = self.pid, "Acquired exclusive lock");
                    return Ok(LockGuard {
                        lock: self.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LockError::io(&self.path, e)),
            }

            let Some(observed) = self.read_raw()? else {
                continue;
            };
            match serde_json::from_slice::<LockMarker>(&observed).ok() {
                Some(marker) if self.liveness.is_alive(marker.pid) => {
                    return Err(LockError::Held {
                        pid: marker.pid,
                        path: self.path.clone(),
                    });
                }
                Some(marker) => {
                    warn!(
                        path = %self.path.display(),
                        stale_pid = marker.pid,
                        acquired_at = %marker.acquired_at,
                        "Replacing lock marker left by a process that is no longer running"
                    );
                }
                None => {
                    warn!(path = %self.path.display(), "Replacing unreadable lock marker");
                }
            }

            if !self.discard_if_unchanged(&observed)? {
                debug!(
                    path = %self.path.display(),
                    "Lock marker changed while its holder was checked, retrying"
                );
            }
        }

        // Lost every race; report whoever holds it now.
        match self.holder()? {
            Some(marker) => Err(LockError::Held {
                pid: marker.pid,
                path: self.path.clone(),
            }),
            None => Err(LockError::io(
                &self.path,
                io::Error::new(io::ErrorKind::WouldBlock, "lock marker is contended"),
            )),
        }
    }

    /// Remove the marker if it still records our pid. Idempotent.
    ///
    /// Returns whether a marker was removed.
    pub fn release(&self) -> Result<bool, LockError> {
        match self.holder()? {
            Some(marker) if marker.pid == self.pid => {
                match std::fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                    Err(e) => return Err(LockError::io(&self.path, e)),
                }
                info!(path = %self.path.display(), pid = self.pid, "Released exclusive lock");
                Ok(true)
            }
            Some(marker) => {
                debug!(
                    path = %self.path.display(),
                    holder = marker.pid,
                    "Lock marker belongs to another process, leaving it"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn read_raw(&self) -> Result<Option<Vec<u8>>, LockError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::io(&self.path, e)),
        }
    }

    /// Remove the marker only if it still holds exactly `observed`.
    ///
    /// Markers carry a nanosecond timestamp, so equal bytes mean the same
    /// marker. Reapers are serialized; publishers never overwrite, so the
    /// marker cannot change between the comparison and the unlink.
    fn discard_if_unchanged(&self, observed: &[u8]) -> Result<bool, LockError> {
        #[cfg(unix)]
        let _reaping = self.lock_reaper()?;

        match self.read_raw()? {
            Some(current) if current == observed => {}
            _ => return Ok(false),
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::io(&self.path, e)),
        }
    }

    /// Advisory lock on a sidecar file held while a stale marker is removed.
    /// The kernel drops it if the reaper dies.
    #[cfg(unix)]
    fn lock_reaper(&self) -> Result<nix::fcntl::Flock<std::fs::File>, LockError> {
        use nix::fcntl::{Flock, FlockArg};

        let path = self.sidecar("reap");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LockError::io(&path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| LockError::io(&path, io::Error::from(errno)))
    }

    fn sidecar(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}", suffix));
        self.path.with_file_name(name)
    }

    /// Write the marker to a private temp file, then hard-link it into place.
    fn try_publish(&self) -> io::Result<()> {
        let marker = LockMarker {
            pid: self.pid,
            acquired_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&marker).map_err(io::Error::other)?;

        let tmp = self.sidecar(&format!("{}.{}.tmp", self.pid, uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, &bytes)?;
        let linked = std::fs::hard_link(&tmp, &self.path);
        let _ = std::fs::remove_file(&tmp);
        linked
    }
}

/// Holds the lock until dropped or released.
#[derive(Debug)]
pub struct LockGuard {
    lock: ExclusiveLock,
    released: bool,
}

impl LockGuard {
    /// Release now rather than on drop.
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.lock.release()
    }

    /// Marker path.
    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.release() {
            warn!(path = %self.lock.path.display(), error = %e, "Failed to release lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLiveness(bool);

    impl ProcessLiveness for FixedLiveness {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn write_marker(path: &Path, pid: u32) {
        let marker = LockMarker {
            pid,
            acquired_at: Utc::now(),
        };
        std::fs::write(path, serde_json::to_vec(&marker).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_writes_pid_and_release_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.lock");
        let lock = ExclusiveLock::new(&path, Arc::new(FixedLiveness(true)));

        let guard = lock.acquire().unwrap();
        let marker = lock.holder().unwrap().unwrap();
        assert_eq!(marker.pid, std::process::id());

        assert!(guard.release().unwrap());
        assert!(!path.exists());
        assert!(!lock.release().unwrap(), "release is idempotent");
    }

    #[test]
    fn test_live_holder_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.lock");
        write_marker(&path, 4242);

        let lock = ExclusiveLock::new(&path, Arc::new(FixedLiveness(true)));
        match lock.acquire() {
            Err(LockError::Held { pid, .. }) => assert_eq!(pid, 4242),
            other => panic!("expected Held, got {:?}", other.map(|_| ())),
        }
        assert_eq!(lock.holder().unwrap().unwrap().pid, 4242);
    }

    #[test]
    fn test_stale_marker_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.lock");
        write_marker(&path, 4242);

        let lock = ExclusiveLock::new(&path, Arc::new(FixedLiveness(false)));
        let _guard = lock.acquire().unwrap();
        assert_eq!(lock.holder().unwrap().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_corrupt_marker_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.lock");
        std::fs::write(&path, b"not json").unwrap();

        let lock = ExclusiveLock::new(&path, Arc::new(FixedLiveness(true)));
        let _guard = lock.acquire().unwrap();
        assert_eq!(lock.holder().unwrap().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_release_leaves_foreign_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.lock");
        write_marker(&path, 4242);

        let lock = ExclusiveLock::new(&path, Arc::new(FixedLiveness(true)));
        assert!(!lock.release().unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keel.lock");
        let lock = ExclusiveLock::new(&path, Arc::new(FixedLiveness(true)));
        {
            let _guard = lock.acquire().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_second_process_blocked_while_first_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.lock");
        let first = ExclusiveLock::new(&path, Arc::new(FixedLiveness(true))).with_pid(1111);
        let second = ExclusiveLock::new(&path, Arc::new(FixedLiveness(true))).with_pid(2222);

        let guard = first.acquire().unwrap();
        assert!(matches!(second.acquire(), Err(LockError::Held { pid: 1111, .. })));

        // A release from the non-holder leaves the marker alone.
        assert!(!second.release().unwrap());
        drop(guard);
        let _second_guard = second.acquire().unwrap();
    }

    /// Lets another acquirer win while the stale holder is being checked.
    struct RacingLiveness {
        rival: ExclusiveLock,
        rival_guard: std::sync::Mutex<Option<LockGuard>>,
    }

    impl ProcessLiveness for RacingLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            if pid == 4242 {
                let mut slot = self.rival_guard.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(self.rival.acquire().unwrap());
                }
                return false;
            }
            true
        }
    }

    #[test]
    fn test_stale_replacement_keeps_marker_published_meanwhile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.lock");
        write_marker(&path, 4242);

        let rival = ExclusiveLock::new(&path, Arc::new(FixedLiveness(false))).with_pid(1111);
        let liveness = Arc::new(RacingLiveness {
            rival,
            rival_guard: std::sync::Mutex::new(None),
        });
        let late = ExclusiveLock::new(&path, liveness.clone()).with_pid(2222);

        assert!(matches!(late.acquire(), Err(LockError::Held { pid: 1111, .. })));
        assert!(liveness.rival_guard.lock().unwrap().is_some());
        assert_eq!(late.holder().unwrap().unwrap().pid, 1111);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_liveness_sees_self() {
        assert!(UnixProcessLiveness.is_alive(std::process::id()));
    }

    #[test]
    fn test_sysinfo_liveness_sees_self() {
        assert!(SysinfoProcessLiveness.is_alive(std::process::id()));
    }
}
