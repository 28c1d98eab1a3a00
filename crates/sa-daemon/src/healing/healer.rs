//! Remediation actions, one per [`ErrorPattern`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sa_core::git::GitRunner;
use sa_core::layout::DataLayout;
use sa_core::lockfile::{self, LockFileState};
use sa_core::worktree_manager::WorktreeManager;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::analyzer::Diagnosis;
use super::patterns::ErrorPattern;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealingResult {
    pub success: bool,
    pub message: String,
    pub action_taken: Option<String>,
    pub context: serde_json::Value,
}

impl HealingResult {
    pub fn success(message: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            action_taken: Some(action.into()),
            context: serde_json::Value::Null,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            action_taken: None,
            context: serde_json::Value::Null,
        }
    }

    /// No automated remediation exists for this pattern.
    pub fn manual(pattern: ErrorPattern) -> Self {
        Self::failure(format!("manual intervention required for {pattern}"))
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

pub struct Healer {
    layout: DataLayout,
    worktrees: Arc<WorktreeManager>,
    git: Arc<dyn GitRunner>,
    stale_after: Duration,
}

impl Healer {
    pub fn new(
        layout: DataLayout,
        worktrees: Arc<WorktreeManager>,
        git: Arc<dyn GitRunner>,
        stale_after: Duration,
    ) -> Self {
        Self {
            layout,
            worktrees,
            git,
            stale_after,
        }
    }

    pub async fn execute(&self, diagnosis: &Diagnosis) -> HealingResult {
        let pattern = diagnosis.pattern();
        info!(pattern = %pattern, action = %diagnosis.recommended_action, "executing healing action");
        let result = match pattern {
            ErrorPattern::DatabaseLocked => self.heal_database_lock().await,
            ErrorPattern::TooManyFiles => heal_descriptor_exhaustion(),
            ErrorPattern::WorktreeConflict => self.heal_worktree_conflict().await,
            ErrorPattern::LockFileStuck => self.heal_stale_lock().await,
            ErrorPattern::GitError => self.heal_git_error().await,
            ErrorPattern::WorkerFailure | ErrorPattern::Timeout => HealingResult::manual(pattern),
        };
        if result.success {
            info!(pattern = %pattern, message = %result.message, "healing succeeded");
        } else {
            warn!(pattern = %pattern, message = %result.message, "healing failed");
        }
        result
    }

    /// Force WAL mode and a checkpoint on the task store, then drop rollback
    /// journals left behind by crashed writers.
    async fn heal_database_lock(&self) -> HealingResult {
        let db = self.layout.db_path();
        if !db.exists() {
            return HealingResult::failure(format!("task store not found at {}", db.display()));
        }

        let db_for_pragma = db.clone();
        let pragma = tokio::task::spawn_blocking(move || -> rusqlite::Result<String> {
            let conn = rusqlite::Connection::open(&db_for_pragma)?;
            conn.busy_timeout(Duration::from_secs(30))?;
            let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(mode)
        })
        .await;

        let mode = match pragma {
            Ok(Ok(mode)) => mode,
            Ok(Err(e)) => return HealingResult::failure(format!("failed to enable WAL: {e}")),
            Err(e) => return HealingResult::failure(format!("WAL task aborted: {e}")),
        };

        let mut removed = Vec::new();
        let dirs = [db.parent().map(Path::to_path_buf), Some(self.layout.root().to_path_buf())];
        for dir in dirs.into_iter().flatten() {
            removed.extend(remove_stale_files(&dir, "-journal", self.stale_after).await);
        }

        HealingResult::success(
            format!("journal_mode={mode}, removed {} stale journal(s)", removed.len()),
            "enabled WAL, checkpointed, removed stale journals",
        )
        .with_context(json!({
            "journal_mode": mode,
            "removed": removed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        }))
    }

    async fn heal_worktree_conflict(&self) -> HealingResult {
        match self.worktrees.prune_orphaned_worktrees().await {
            Ok(removed) => HealingResult::success(
                format!("pruned worktrees, removed {removed} orphaned directories"),
                "git worktree prune + orphan cleanup",
            )
            .with_context(json!({ "orphans_removed": removed })),
            Err(e) => HealingResult::failure(format!("worktree prune failed: {e}")),
        }
    }

    /// Remove the runner lock only when its owner is gone.
    async fn heal_stale_lock(&self) -> HealingResult {
        let path = self.layout.lock_path();
        let owner = match lockfile::inspect(&path) {
            LockFileState::Missing => {
                return HealingResult::failure(format!("no lock file at {}", path.display()))
            }
            LockFileState::Held(pid) => {
                return HealingResult::failure(format!("lock held, process {pid} is running"))
                    .with_context(json!({ "pid": pid }))
            }
            LockFileState::Stale(pid) => Some(pid),
            LockFileState::Invalid => None,
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => HealingResult::success(
                format!("removed stale lock {}", path.display()),
                "removed stale lock file",
            )
            .with_context(json!({ "pid": owner })),
            Err(e) => HealingResult::failure(format!("failed to remove {}: {e}", path.display())),
        }
    }

    async fn heal_git_error(&self) -> HealingResult {
        let repo = self.layout.repo();
        let prune = match self.git.run_git(repo, &["worktree", "prune"]).await {
            Ok(out) if out.success => true,
            Ok(out) => {
                warn!(error = %out.message(), "git worktree prune failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "git could not be run");
                false
            }
        };
        let index_locks = remove_stale_files(&repo.join(".git"), "index.lock", self.stale_after).await;

        if !prune && index_locks.is_empty() {
            return HealingResult::failure("git cleanup made no progress");
        }
        HealingResult::success(
            format!("worktree prune ok={prune}, removed {} index lock(s)", index_locks.len()),
            "git worktree prune + stale index.lock removal",
        )
        .with_context(json!({ "pruned": prune, "index_locks_removed": index_locks.len() }))
    }
}

/// Count our descriptors and raise the soft open-file limit to the hard
/// limit.
fn heal_descriptor_exhaustion() -> HealingResult {
    let before = open_descriptor_count();
    let limits = raise_nofile_limit();
    let after = open_descriptor_count();
    let context = json!({
        "open_before": before,
        "open_after": after,
        "limit": limits.map(|(old, new)| json!({ "before": old, "after": new })),
    });

    match limits {
        Some((old, new)) if new > old => HealingResult::success(
            format!("raised open file limit {old} -> {new}"),
            "raised RLIMIT_NOFILE soft limit",
        )
        .with_context(context),
        Some((old, _)) => HealingResult::failure(format!(
            "open file limit already at maximum ({old}); {} descriptors open",
            before.map_or_else(|| "unknown".to_string(), |n| n.to_string())
        ))
        .with_context(context),
        None => HealingResult::failure("open file limit cannot be adjusted").with_context(context),
    }
}

pub fn open_descriptor_count() -> Option<usize> {
    ["/proc/self/fd", "/dev/fd"]
        .iter()
        .find_map(|dir| std::fs::read_dir(dir).ok().map(|entries| entries.count()))
}

#[cfg(unix)]
fn raise_nofile_limit() -> Option<(u64, u64)> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit/setrlimit only read and write the struct we pass.
    unsafe {
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) != 0 {
            return None;
        }
        let old = lim.rlim_cur as u64;
        if lim.rlim_cur >= lim.rlim_max {
            return Some((old, old));
        }
        lim.rlim_cur = lim.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &lim) != 0 {
            return Some((old, old));
        }
        Some((old, lim.rlim_cur as u64))
    }
}

#[cfg(not(unix))]
fn raise_nofile_limit() -> Option<(u64, u64)> {
    None
}

/// Delete files in `dir` whose name ends with `suffix` and that were last
/// modified more than `older_than` ago.
async fn remove_stale_files(dir: &Path, suffix: &str, older_than: Duration) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return removed;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix));
        if !matches {
            continue;
        }
        let age = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());
        if age.is_some_and(|a| a >= older_than) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "removed stale file");
                    removed.push(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale file"),
            }
        }
    }
    removed
}
