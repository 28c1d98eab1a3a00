//! Single-runner process lock.
//!
//! The runner writes its PID to `<data>/runner.lock` before doing any work,
//! so at most one orchestration cycle touches a repository at a time.
//!
//! ## Race safety
//!
//! `acquire()` uses `O_CREAT | O_EXCL` to atomically create the lock file.
//! If two runners race, exactly one wins the create. The loser reads the
//! recorded PID and checks whether that process is still alive.
//!
//! ## Stale lock recovery
//!
//! A lock whose PID is dead (crash, SIGKILL) or whose content is not a PID
//! is removed and the acquire is retried once.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another runner is active (pid {0})")]
    AlreadyRunning(u32),
    #[error("failed to acquire lock after stale cleanup")]
    Contended,
    #[error("lock file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one attempt to create the lock file.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireResult {
    /// We created the lock file and own it.
    Acquired,
    /// A live process holds the lock.
    AlreadyRunning(u32),
    /// A stale or corrupt lock was removed; retry.
    StaleRemoved,
}

/// What is currently on disk at a lock path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFileState {
    Missing,
    /// PID recorded and the process is alive.
    Held(u32),
    /// PID recorded but no such process.
    Stale(u32),
    /// File exists but does not contain a PID.
    Invalid,
}

/// Inspect a lock file without modifying it.
pub fn inspect(path: &Path) -> LockFileState {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LockFileState::Missing,
        Err(_) => return LockFileState::Invalid,
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if pid_alive(pid) => LockFileState::Held(pid),
        Ok(pid) => LockFileState::Stale(pid),
        Err(_) => LockFileState::Invalid,
    }
}

pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try once to exclusively create the lock file.
    pub fn acquire(&self) -> std::io::Result<AcquireResult> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match inspect(&self.path) {
                LockFileState::Held(pid) => Ok(AcquireResult::AlreadyRunning(pid)),
                LockFileState::Missing => Ok(AcquireResult::StaleRemoved),
                state => {
                    tracing::info!(path = %self.path.display(), ?state, "removing stale runner lock");
                    remove_if_exists(&self.path)?;
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Acquire with one retry after stale cleanup. The returned guard
    /// removes the lock file when dropped.
    pub fn acquire_or_fail(&self) -> Result<LockGuard, LockError> {
        for attempt in 0..2 {
            match self.acquire()? {
                AcquireResult::Acquired => {
                    tracing::debug!(path = %self.path.display(), "runner lock acquired");
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        pid: std::process::id(),
                    });
                }
                AcquireResult::AlreadyRunning(pid) => return Err(LockError::AlreadyRunning(pid)),
                AcquireResult::StaleRemoved if attempt == 0 => continue,
                AcquireResult::StaleRemoved => break,
            }
        }
        Err(LockError::Contended)
    }
}

/// Held runner lock. Released on drop if the file still records our PID.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| c.trim().parse::<u32>().ok())
            == Some(self.pid);
        if ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Assume alive so a lock is never removed by mistake.
    true
}
