use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::{AgentRequest, AgentRunner};
use crate::git::GitRunner;
use crate::types::Level;

/// Marker an agent prints once every conflict is resolved.
pub const CONFLICTS_RESOLVED_MARKER: &str = "CONFLICTS_RESOLVED";

const BRANCH_PREFIX: &str = "selfai/task-";
const MAX_SLUG_LEN: usize = 50;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("worktree already active for task #{0}")]
    Conflict(i64),
    #[error("insufficient disk space: {available_mb}MB free, {required_mb}MB required")]
    Resource { available_mb: u64, required_mb: u64 },
    #[error("could not determine free disk space: {0}")]
    DiskCheck(std::io::Error),
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// Records and outcomes
// ---------------------------------------------------------------------------

/// A worktree checked out for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub task_id: i64,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of merging a task branch into main.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    Merged,
    /// The merge stopped with conflicts in these files. The merge is left
    /// in progress so it can be resolved or aborted.
    Conflicts(Vec<String>),
    Failed(String),
}

/// Outcome of an agent-driven conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    Resolved,
    /// The agent finished but these files are still conflicted.
    Unresolved(Vec<String>),
    AgentFailed(String),
}

/// A conflicted file and its current (marker-laden) content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedFile {
    pub path: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Task-oriented git worktree operations.
///
/// Each task gets `<root>/task-<id>` on branch `selfai/task-<id>-<slug>`.
/// At most one worktree per task is tracked at a time.
pub struct WorktreeManager {
    repo: PathBuf,
    root: PathBuf,
    base_branch: String,
    git: Arc<dyn GitRunner>,
    records: DashMap<i64, WorktreeRecord>,
    min_free_bytes: u64,
    conflict_timeout: Duration,
    conflict_tools: Vec<String>,
}

impl WorktreeManager {
    pub const DEFAULT_MIN_FREE_MB: u64 = 500;
    pub const DEFAULT_CONFLICT_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(repo: impl Into<PathBuf>, root: impl Into<PathBuf>, git: Arc<dyn GitRunner>) -> Self {
        Self {
            repo: repo.into(),
            root: root.into(),
            base_branch: "main".to_string(),
            git,
            records: DashMap::new(),
            min_free_bytes: Self::DEFAULT_MIN_FREE_MB * 1024 * 1024,
            conflict_timeout: Self::DEFAULT_CONFLICT_TIMEOUT,
            conflict_tools: ["Read", "Edit", "Bash"].map(String::from).to_vec(),
        }
    }

    pub fn with_min_free_mb(mut self, mb: u64) -> Self {
        self.min_free_bytes = mb.saturating_mul(1024 * 1024);
        self
    }

    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = branch.into();
        self
    }

    pub fn with_conflict_timeout(mut self, timeout: Duration) -> Self {
        self.conflict_timeout = timeout;
        self
    }

    pub fn with_conflict_tools(mut self, tools: Vec<String>) -> Self {
        self.conflict_tools = tools;
        self
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn git(&self) -> &Arc<dyn GitRunner> {
        &self.git
    }

    pub fn worktree_path(&self, task_id: i64) -> PathBuf {
        self.root.join(format!("task-{task_id}"))
    }

    pub fn get(&self, task_id: i64) -> Option<WorktreeRecord> {
        self.records.get(&task_id).map(|r| r.value().clone())
    }

    /// Tracked worktrees ordered by task id.
    pub fn active_worktrees(&self) -> Vec<WorktreeRecord> {
        let mut out: Vec<WorktreeRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by_key(|r| r.task_id);
        out
    }

    async fn git_in(&self, dir: &Path, args: &[&str]) -> Result<crate::git::GitOutput> {
        self.git
            .run_git(dir, args)
            .await
            .map_err(WorktreeError::GitCommand)
    }

    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<crate::git::GitOutput> {
        let out = self.git_in(dir, args).await?;
        if out.success {
            Ok(out)
        } else {
            Err(WorktreeError::GitCommand(format!(
                "git {}: {}",
                args.join(" "),
                out.message()
            )))
        }
    }

    fn check_disk_space(&self) -> Result<()> {
        match fs2::available_space(&self.repo) {
            Ok(available) if available < self.min_free_bytes => Err(WorktreeError::Resource {
                available_mb: available / (1024 * 1024),
                required_mb: self.min_free_bytes / (1024 * 1024),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(WorktreeError::DiskCheck(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create (or re-attach) the worktree for a task.
    ///
    /// An existing task branch is checked out as-is so work parked at a
    /// previous level carries over; otherwise a new branch is cut from main.
    pub async fn create_worktree(&self, task_id: i64, title: &str) -> Result<WorktreeRecord> {
        self.check_disk_space()?;

        let branch = branch_name(task_id, title);
        let path = self.worktree_path(task_id);
        let record = WorktreeRecord {
            task_id,
            path: path.clone(),
            branch: branch.clone(),
            created_at: Utc::now(),
        };

        match self.records.entry(task_id) {
            Entry::Occupied(_) => return Err(WorktreeError::Conflict(task_id)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }

        match self.add_worktree(&path, &branch).await {
            Ok(()) => {
                info!(task_id, worktree = %path.display(), branch = %branch, "worktree created");
                Ok(record)
            }
            Err(e) => {
                self.records.remove(&task_id);
                Err(e)
            }
        }
    }

    async fn add_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        if path.exists() {
            self.remove_directory(path).await?;
        }

        let path_str = path.to_string_lossy().to_string();
        let branch_ref = format!("refs/heads/{branch}");
        let exists = self
            .git_in(&self.repo, &["rev-parse", "--verify", "--quiet", &branch_ref])
            .await?
            .success;

        if exists {
            self.git_ok(&self.repo, &["worktree", "add", &path_str, branch])
                .await?;
        } else {
            self.git_ok(
                &self.repo,
                &["worktree", "add", "-b", branch, &path_str, &self.base_branch],
            )
            .await?;
        }
        Ok(())
    }

    /// Remove a task's worktree and delete its branch. Best effort; unknown
    /// task ids are a no-op. Returns whether anything was tracked.
    pub async fn cleanup_worktree(&self, task_id: i64, force: bool) -> bool {
        let Some((_, record)) = self.records.remove(&task_id) else {
            return false;
        };

        let branch = match self
            .git
            .run_git(&record.path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
        {
            Ok(out) if out.success && !out.stdout.trim().is_empty() && out.stdout.trim() != "HEAD" => {
                out.stdout.trim().to_string()
            }
            _ => record.branch.clone(),
        };

        let path_str = record.path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);

        let removed = match self.git.run_git(&self.repo, &args).await {
            Ok(out) if out.success => true,
            Ok(out) => {
                warn!(task_id, stderr = %out.stderr.trim(), "git worktree remove failed");
                false
            }
            Err(e) => {
                warn!(task_id, error = %e, "git worktree remove failed");
                false
            }
        };

        if !removed && force {
            if let Err(e) = self.remove_directory(&record.path).await {
                warn!(task_id, error = %e, "failed to remove worktree directory");
            }
        }

        if removed || force {
            match self.git.run_git(&self.repo, &["branch", "-D", &branch]).await {
                Ok(out) if out.success => debug!(task_id, branch = %branch, "branch deleted"),
                Ok(out) => warn!(task_id, branch = %branch, stderr = %out.stderr.trim(), "branch delete failed"),
                Err(e) => warn!(task_id, branch = %branch, error = %e, "branch delete failed"),
            }
        }

        info!(task_id, worktree = %record.path.display(), "worktree cleaned up");
        true
    }

    /// Commit the task's work on its branch, then remove the worktree
    /// directory while keeping the branch for the next level or the merge.
    pub async fn release_worktree(&self, task_id: i64, level: Level, title: &str) -> Result<bool> {
        let Some(record) = self.get(task_id) else {
            return Ok(false);
        };

        self.git_ok(&record.path, &["add", "-A"]).await?;
        let message = format!("[SelfAI] {level}: {title}\n\nFeature #{task_id}");
        let commit = self
            .git_in(&record.path, &["commit", "-m", &message])
            .await?;
        if !commit.success && !nothing_to_commit(&commit) {
            return Err(WorktreeError::GitCommand(format!(
                "commit failed: {}",
                commit.message()
            )));
        }

        let path_str = record.path.to_string_lossy().to_string();
        let out = self
            .git_in(&self.repo, &["worktree", "remove", "--force", &path_str])
            .await?;
        if !out.success {
            warn!(task_id, stderr = %out.stderr.trim(), "worktree remove failed, deleting directory");
            self.remove_directory(&record.path).await?;
            let _ = self.git.run_git(&self.repo, &["worktree", "prune"]).await;
        }

        self.records.remove(&task_id);
        info!(task_id, branch = %record.branch, level = %level, "worktree parked");
        Ok(true)
    }

    /// Drop a failed attempt: the worktree and its uncommitted changes go,
    /// the branch keeps whatever earlier levels committed.
    pub async fn discard_worktree(&self, task_id: i64) -> bool {
        let Some((_, record)) = self.records.remove(&task_id) else {
            return false;
        };
        if let Err(e) = self.remove_directory(&record.path).await {
            warn!(task_id, error = %e, "failed to remove worktree directory");
        }
        info!(task_id, branch = %record.branch, "worktree discarded");
        true
    }

    /// Commit what a tester changed in `work_dir` (a checkout of
    /// `source_branch`) and move the task branch to it. Returns `false`
    /// when there was nothing to carry over.
    pub async fn carry_over(
        &self,
        task_id: i64,
        title: &str,
        level: Level,
        work_dir: &Path,
        source_branch: &str,
    ) -> Result<bool> {
        self.git_ok(work_dir, &["add", "-A"]).await?;
        let message = format!("[SelfAI] {level} test fixes: {title}\n\nFeature #{task_id}");
        let commit = self.git_in(work_dir, &["commit", "-m", &message]).await?;
        if !commit.success {
            if nothing_to_commit(&commit) {
                return Ok(false);
            }
            return Err(WorktreeError::GitCommand(format!(
                "commit failed: {}",
                commit.message()
            )));
        }

        let branch = branch_name(task_id, title);
        self.git_ok(&self.repo, &["branch", "-f", &branch, source_branch])
            .await?;
        info!(task_id, branch = %branch, "test fixes carried over");
        Ok(true)
    }

    /// Remove an untracked leftover directory for `task_id`, e.g. after a
    /// crash. Returns whether anything was removed.
    pub async fn reclaim_stale(&self, task_id: i64) -> Result<bool> {
        if self.records.contains_key(&task_id) {
            return Ok(false);
        }
        let path = self.worktree_path(task_id);
        if !path.exists() {
            return Ok(false);
        }
        warn!(task_id, worktree = %path.display(), "reclaiming stale worktree");
        self.remove_directory(&path).await?;
        Ok(true)
    }

    async fn remove_directory(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        let _ = self
            .git
            .run_git(&self.repo, &["worktree", "remove", "--force", &path_str])
            .await;
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        let _ = self.git.run_git(&self.repo, &["worktree", "prune"]).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Merge the task branch into main with a merge commit.
    pub async fn merge_to_main(&self, task_id: i64, title: &str) -> MergeOutcome {
        let branch = self
            .get(task_id)
            .map(|r| r.branch)
            .unwrap_or_else(|| branch_name(task_id, title));

        info!(task_id, branch = %branch, "merging to {}", self.base_branch);

        match self.git.run_git(&self.repo, &["checkout", &self.base_branch]).await {
            Ok(out) if out.success => {}
            Ok(out) => return MergeOutcome::Failed(format!("checkout failed: {}", out.message())),
            Err(e) => return MergeOutcome::Failed(e),
        }

        match self
            .git
            .run_git(&self.repo, &["pull", "origin", &self.base_branch])
            .await
        {
            Ok(out) if !out.success => debug!(stderr = %out.stderr.trim(), "pull skipped"),
            Err(e) => debug!(error = %e, "pull skipped"),
            _ => {}
        }

        let message = format!("[SelfAI] {title} (#{task_id})");
        let merge = match self
            .git
            .run_git(&self.repo, &["merge", "--no-ff", &branch, "-m", &message])
            .await
        {
            Ok(out) => out,
            Err(e) => return MergeOutcome::Failed(e),
        };
        if merge.success {
            info!(task_id, branch = %branch, "merge successful");
            return MergeOutcome::Merged;
        }

        let conflicts = self.conflicted_files().await;
        if conflicts.is_empty() {
            let _ = self.git.run_git(&self.repo, &["merge", "--abort"]).await;
            warn!(task_id, stderr = %merge.stderr.trim(), "merge failed");
            return MergeOutcome::Failed(merge.message());
        }

        warn!(task_id, conflicts = ?conflicts, "merge conflicts detected");
        MergeOutcome::Conflicts(conflicts)
    }

    /// Delete a task branch once its work is on main.
    pub async fn delete_branch(&self, task_id: i64, title: &str) -> bool {
        let branch = branch_name(task_id, title);
        match self.git.run_git(&self.repo, &["branch", "-D", &branch]).await {
            Ok(out) if out.success => {
                debug!(task_id, branch = %branch, "branch deleted");
                true
            }
            Ok(out) => {
                warn!(task_id, branch = %branch, stderr = %out.stderr.trim(), "branch delete failed");
                false
            }
            Err(e) => {
                warn!(task_id, branch = %branch, error = %e, "branch delete failed");
                false
            }
        }
    }

    async fn conflicted_files(&self) -> Vec<String> {
        match self
            .git
            .run_git(&self.repo, &["diff", "--name-only", "--diff-filter=U"])
            .await
        {
            Ok(out) if out.success => out.lines(),
            _ => Vec::new(),
        }
    }

    /// Ask an agent to resolve an in-progress merge. On any failure the
    /// merge is aborted and main is left as it was.
    pub async fn resolve_conflicts<F>(
        &self,
        task_id: i64,
        title: &str,
        files: &[String],
        agent: &dyn AgentRunner,
        build_prompt: F,
    ) -> ResolutionOutcome
    where
        F: FnOnce(&[ConflictedFile]) -> String,
    {
        let mut conflicted = Vec::with_capacity(files.len());
        for file in files {
            let content = tokio::fs::read_to_string(self.repo.join(file))
                .await
                .unwrap_or_default();
            conflicted.push(ConflictedFile {
                path: file.clone(),
                content,
            });
        }

        let request = AgentRequest::new(build_prompt(&conflicted), &self.repo, self.conflict_timeout)
            .with_tools(self.conflict_tools.iter().cloned());

        info!(task_id, files = conflicted.len(), "resolving merge conflicts");
        let reason = match agent.run(request).await {
            Err(e) => Some(e.to_string()),
            Ok(out) if !out.success => Some(out.failure_reason()),
            Ok(out) if !out.stdout.contains(CONFLICTS_RESOLVED_MARKER) => {
                Some("agent did not confirm resolution".to_string())
            }
            Ok(_) => None,
        };
        if let Some(reason) = reason {
            self.abort_merge(task_id).await;
            return ResolutionOutcome::AgentFailed(reason);
        }

        let mut remaining = Vec::new();
        for file in files {
            let content = tokio::fs::read_to_string(self.repo.join(file))
                .await
                .unwrap_or_default();
            if has_conflict_markers(&content) {
                remaining.push(file.clone());
            }
        }
        if remaining.is_empty() {
            for file in files {
                if let Err(e) = self.git_ok(&self.repo, &["add", "--", file]).await {
                    warn!(task_id, file = %file, error = %e, "git add failed");
                }
            }
            remaining = self.conflicted_files().await;
        }
        if !remaining.is_empty() {
            self.abort_merge(task_id).await;
            return ResolutionOutcome::Unresolved(remaining);
        }

        let message = format!("[SelfAI] Resolve conflicts for #{task_id}: {title}");
        if let Err(e) = self.git_ok(&self.repo, &["commit", "-m", &message]).await {
            self.abort_merge(task_id).await;
            return ResolutionOutcome::AgentFailed(e.to_string());
        }

        info!(task_id, "merge conflicts resolved");
        ResolutionOutcome::Resolved
    }

    async fn abort_merge(&self, task_id: i64) {
        match self.git.run_git(&self.repo, &["merge", "--abort"]).await {
            Ok(out) if out.success => debug!(task_id, "merge aborted"),
            Ok(out) => warn!(task_id, stderr = %out.stderr.trim(), "merge abort failed"),
            Err(e) => warn!(task_id, error = %e, "merge abort failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Prune git's worktree metadata and delete untracked directories under
    /// the worktree root that are not git checkouts. Returns the number of
    /// directories removed.
    pub async fn prune_orphaned_worktrees(&self) -> Result<usize> {
        if let Err(e) = self.git_ok(&self.repo, &["worktree", "prune"]).await {
            warn!(error = %e, "git worktree prune failed");
        }

        if !self.root.exists() {
            return Ok(0);
        }

        let tracked: Vec<PathBuf> = self.records.iter().map(|r| r.path.clone()).collect();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() || tracked.contains(&path) || path.join(".git").exists() {
                continue;
            }
            info!(path = %path.display(), "removing orphaned worktree directory");
            tokio::fs::remove_dir_all(&path).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Branch for a task: `selfai/task-<id>-<slug>`.
pub fn branch_name(task_id: i64, title: &str) -> String {
    format!("{BRANCH_PREFIX}{task_id}-{}", slugify(title))
}

/// Lowercase, runs of non-alphanumerics collapsed to `-`, trimmed, capped.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug: String = slug.trim_matches('-').chars().take(MAX_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

fn nothing_to_commit(out: &crate::git::GitOutput) -> bool {
    let text = format!("{}{}", out.stdout, out.stderr).to_lowercase();
    text.contains("nothing to commit") || text.contains("nothing added to commit")
}

fn has_conflict_markers(content: &str) -> bool {
    content
        .lines()
        .any(|l| l.starts_with("<<<<<<< ") || l.starts_with(">>>>>>> ") || l == "=======")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_and_lowercases() {
        assert_eq!(slugify("Add  Dark-Mode toggle!"), "add-dark-mode-toggle");
        assert_eq!(slugify("  --Hello__World--  "), "hello-world");
    }

    #[test]
    fn slug_falls_back_for_symbols() {
        assert_eq!(slugify("!!!"), "task");
        assert_eq!(slugify(""), "task");
    }

    #[test]
    fn slug_is_capped() {
        let long = "a".repeat(80);
        assert_eq!(slugify(&long).len(), MAX_SLUG_LEN);
        let dashed = format!("{}-{}", "b".repeat(49), "c".repeat(10));
        assert_eq!(slugify(&dashed), "b".repeat(49));
    }

    #[test]
    fn branch_name_format() {
        assert_eq!(branch_name(7, "Fix Login"), "selfai/task-7-fix-login");
        assert_eq!(branch_name(7, "Fix Null Pointer!!"), "selfai/task-7-fix-null-pointer");
    }

    #[test]
    fn conflict_markers_detected() {
        assert!(has_conflict_markers("a\n<<<<<<< HEAD\nb\n=======\nc\n>>>>>>> x\n"));
        assert!(!has_conflict_markers("fn main() {}\n"));
    }
}
