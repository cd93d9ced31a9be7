// SPDX-License-Identifier: MIT

//! Cross-process mutual exclusion with stale/dead-process cleanup.

use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use sentinel_core::Clock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another deployment is already in progress")]
    AlreadyLocked,
    #[error("malformed lock file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize lock info: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Self-describing text record written at the lock path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub owner_id: String,
}

/// A cross-process lock backed by a single well-known file.
pub struct Lock<'a> {
    path: PathBuf,
    clock: &'a dyn Clock,
}

/// RAII guard returned by [`Lock::acquire`]. Releases on drop, including on
/// panic or an early return.
///
/// Borrows the `Lock` for its own call-site lifetime (`'s`) rather than for
/// the lock's `clock` lifetime (`'a`) — a guard obtained through a short-lived
/// `&self` (as happens whenever `Lock<'a>` sits behind another struct's own
/// `&self` method) must not be forced to outlive that borrow.
pub struct LockGuard<'s, 'a> {
    lock: &'s Lock<'a>,
}

impl Drop for LockGuard<'_, '_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!(error = %e, "failed to release lock on drop");
        }
    }
}

impl<'a> Lock<'a> {
    pub fn new(path: impl Into<PathBuf>, clock: &'a dyn Clock) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    /// Acquire the lock, failing immediately (no wait-on-lock loop) if it is
    /// held by a live, non-stale owner.
    pub fn acquire(&self, timeout: Duration, owner_id: &str) -> Result<LockGuard<'_, 'a>, LockError> {
        if let Some(existing) = self.read_raw()? {
            if self.is_stale(&existing, timeout) {
                info!(pid = existing.pid, "removing stale lock");
                self.remove_file()?;
            } else {
                return Err(LockError::AlreadyLocked);
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: self.clock.now(),
            owner_id: owner_id.to_string(),
        };
        self.write_atomic(&info)?;

        Ok(LockGuard { lock: self })
    }

    /// Remove the lock file. Idempotent: "no such file" counts as success.
    pub fn release(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the current lock info, or `None` if no lock is held.
    pub fn check(&self) -> Result<Option<LockInfo>, LockError> {
        self.read_raw()
    }

    /// Remove the lock file if it is stale; no-op otherwise.
    pub fn cleanup_stale(&self, timeout: Duration) -> Result<(), LockError> {
        if let Some(existing) = self.read_raw()? {
            if self.is_stale(&existing, timeout) {
                self.remove_file()?;
            }
        }
        Ok(())
    }

    fn is_stale(&self, info: &LockInfo, timeout: Duration) -> bool {
        let age = self.clock.now().signed_duration_since(info.acquired_at);
        let age_exceeded = age
            .to_std()
            .map(|age| age > timeout)
            .unwrap_or(false);
        age_exceeded || !is_alive(info.pid)
    }

    fn read_raw(&self) -> Result<Option<LockInfo>, LockError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let info = serde_json::from_str(&contents).map_err(|source| LockError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(info))
    }

    fn write_atomic(&self, info: &LockInfo) -> Result<(), LockError> {
        let tmp_path = tmp_path(&self.path);
        fs::write(&tmp_path, serde_json::to_vec_pretty(info)?)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn remove_file(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

/// Best-effort liveness probe via a signal-zero send.
///
/// Signalling is unreliable on some platforms/namespaces, so any response
/// other than "no such process" is treated as alive — the timeout remains
/// the primary safety net, this probe only helps evict obviously-dead
/// owners sooner.
fn is_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Err(nix::errno::Errno::ESRCH) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::FakeClock;
    use tempfile::tempdir;

    fn dead_pid() -> u32 {
        // Spawn and immediately reap a child so its pid is guaranteed free.
        let child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        let mut child = child;
        let _ = child.wait();
        pid
    }

    #[test]
    fn acquire_then_release_then_acquire_succeeds() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);

        let guard = lock.acquire(Duration::from_secs(1800), "owner-a").unwrap();
        drop(guard);
        let _guard2 = lock.acquire(Duration::from_secs(1800), "owner-a").unwrap();
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);
        lock.release().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn second_acquire_fails_while_first_is_live_and_fresh() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);

        let _guard = lock.acquire(Duration::from_secs(1800), "owner-a").unwrap();
        let err = lock.acquire(Duration::from_secs(1800), "owner-b").unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked));
    }

    #[test]
    fn lock_older_than_timeout_is_removed_even_if_pid_is_live() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: clock.now() - chrono::Duration::minutes(45),
            owner_id: "stale-owner".to_string(),
        };
        fs::write(dir.path().join("d.lock"), serde_json::to_vec(&info).unwrap()).unwrap();

        let _guard = lock
            .acquire(Duration::from_secs(30 * 60), "owner-b")
            .unwrap();
    }

    #[test]
    fn lock_with_dead_pid_is_removed_regardless_of_age() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);

        let info = LockInfo {
            pid: dead_pid(),
            acquired_at: clock.now(),
            owner_id: "dead-owner".to_string(),
        };
        fs::write(dir.path().join("d.lock"), serde_json::to_vec(&info).unwrap()).unwrap();

        let _guard = lock
            .acquire(Duration::from_secs(30 * 60), "owner-b")
            .unwrap();
    }

    #[test]
    fn malformed_lock_file_surfaces_parse_error() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);
        fs::write(dir.path().join("d.lock"), b"not json").unwrap();

        let err = lock.check().unwrap_err();
        assert!(matches!(err, LockError::Parse { .. }));
    }

    #[test]
    fn check_with_no_lock_returns_none() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);
        assert!(lock.check().unwrap().is_none());
    }

    #[test]
    fn cleanup_stale_removes_expired_lock() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);
        let info = LockInfo {
            pid: dead_pid(),
            acquired_at: clock.now(),
            owner_id: "x".to_string(),
        };
        fs::write(dir.path().join("d.lock"), serde_json::to_vec(&info).unwrap()).unwrap();
        lock.cleanup_stale(Duration::from_secs(1800)).unwrap();
        assert!(lock.check().unwrap().is_none());
    }

    #[test]
    fn cleanup_stale_is_noop_for_live_fresh_lock() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);
        let _guard = lock.acquire(Duration::from_secs(1800), "owner").unwrap();
        lock.cleanup_stale(Duration::from_secs(1800)).unwrap();
        assert!(lock.check().unwrap().is_some());
    }

    #[test]
    fn guard_drop_releases_lock() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new(Utc::now());
        let lock = Lock::new(dir.path().join("d.lock"), &clock);
        {
            let _guard = lock.acquire(Duration::from_secs(1800), "owner").unwrap();
            assert!(lock.check().unwrap().is_some());
        }
        assert!(lock.check().unwrap().is_none());
    }
}
