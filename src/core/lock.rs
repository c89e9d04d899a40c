//! Per-segment single-writer advisory lock.
//!
//! The lock file holds `{pid, owner, heartbeat_ms}`. It is created by
//! hard-linking a fully-written temp file into place, so a competing process
//! never observes a half-written lock. A lock is reclaimed only when its pid
//! is gone and its heartbeat is older than the stale window; a live owner
//! keeps the lock however long it buffers between flushes.

use crate::core::error::{ErrorContext, SightlineError, io_at};
use crate::core::storage;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub owner: String,
    pub session_id: String,
    pub heartbeat_ms: u64,
}

impl LockRecord {
    fn is_stale(&self, stale_after: Duration, now_ms: u64) -> bool {
        let age = now_ms.saturating_sub(self.heartbeat_ms);
        age > stale_after.as_millis() as u64 && !pid_alive(self.pid)
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Held writer lock; released on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    record: LockRecord,
}

impl SessionLock {
    pub fn acquire(
        lock_path: &Path,
        session_id: &str,
        stale_after: Duration,
    ) -> Result<Self, SightlineError> {
        let record = LockRecord {
            pid: std::process::id(),
            owner: time::new_id(),
            session_id: session_id.to_string(),
            heartbeat_ms: time::now_millis(),
        };

        // One reclaim attempt, then the second pass either wins or reports contention.
        for _ in 0..2 {
            if try_create(lock_path, &record)? {
                tracing::debug!(session_id, path = %lock_path.display(), "writer lock acquired");
                return Ok(Self {
                    path: lock_path.to_path_buf(),
                    record,
                });
            }
            let holder = match read_holder(lock_path)? {
                Some(holder) => holder,
                None => continue,
            };
            if !holder.is_stale(stale_after, time::now_millis()) {
                return Err(SightlineError::LockContention {
                    owner_pid: holder.pid,
                    context: ErrorContext::session(session_id).with_path(lock_path),
                });
            }
            reclaim(lock_path, &holder)?;
        }

        let owner_pid = read_holder(lock_path)?.map(|h| h.pid).unwrap_or(0);
        Err(SightlineError::LockContention {
            owner_pid,
            context: ErrorContext::session(session_id).with_path(lock_path),
        })
    }

    /// Confirm this handle still owns the lock file, then refresh the heartbeat.
    pub fn heartbeat(&mut self) -> Result<(), SightlineError> {
        match read_holder(&self.path)? {
            Some(holder) if holder.owner == self.record.owner => {}
            other => {
                return Err(SightlineError::LockContention {
                    owner_pid: other.map(|h| h.pid).unwrap_or(0),
                    context: ErrorContext::session(&self.record.session_id).with_path(&self.path),
                });
            }
        }
        self.record.heartbeat_ms = time::now_millis();
        storage::write_json(&self.path, &self.record)
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Ok(Some(holder)) = read_holder(&self.path) {
            if holder.owner == self.record.owner {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

/// `Ok(false)` when another lock file already exists.
fn try_create(lock_path: &Path, record: &LockRecord) -> Result<bool, SightlineError> {
    let dir = lock_path.parent().ok_or_else(|| {
        SightlineError::validation("lock path has no parent", ErrorContext::path(lock_path))
    })?;
    let tmp_path = dir.join(format!(".writer.lock.{}", record.owner));
    {
        let mut tmp = fs::File::create(&tmp_path).map_err(io_at(&tmp_path))?;
        tmp.write_all(&serde_json::to_vec(record)?)
            .map_err(io_at(&tmp_path))?;
        tmp.sync_all().map_err(io_at(&tmp_path))?;
    }
    let linked = fs::hard_link(&tmp_path, lock_path);
    let _ = fs::remove_file(&tmp_path);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(SightlineError::io(e, ErrorContext::path(lock_path))),
    }
}

fn read_holder(lock_path: &Path) -> Result<Option<LockRecord>, SightlineError> {
    match fs::read(lock_path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            SightlineError::corruption(
                format!("undecodable lock file: {}", e),
                ErrorContext::path(lock_path),
            )
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SightlineError::io(e, ErrorContext::path(lock_path))),
    }
}

/// Move a stale lock aside. If a racing writer replaced it in the meantime,
/// put theirs back.
fn reclaim(lock_path: &Path, stale: &LockRecord) -> Result<(), SightlineError> {
    let tomb = lock_path.with_extension(format!("stale-{}", time::new_id()));
    match fs::rename(lock_path, &tomb) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SightlineError::io(e, ErrorContext::path(lock_path))),
    }
    let moved = read_holder(&tomb)?;
    if moved.as_ref().map(|m| &m.owner) != Some(&stale.owner) {
        let _ = fs::hard_link(&tomb, lock_path);
    } else {
        tracing::warn!(
            pid = stale.pid,
            session_id = %stale.session_id,
            path = %lock_path.display(),
            "reclaimed stale writer lock"
        );
    }
    let _ = fs::remove_file(&tomb);
    Ok(())
}
