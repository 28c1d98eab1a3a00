//! Worktree lifecycle, merge and conflict resolution against a scripted git.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sa_core::agent::{AgentError, AgentOutput, AgentRequest, AgentRunner};
use sa_core::git::{GitOutput, GitRunner};
use sa_core::types::Level;
use sa_core::worktree_manager::{
    MergeOutcome, ResolutionOutcome, WorktreeError, WorktreeManager,
};

// ===========================================================================
// Mocks
// ===========================================================================

/// Records every git invocation. Responses are matched by argument prefix
/// and consumed once; unmatched commands succeed with empty output.
#[derive(Default)]
struct MockGitRunner {
    rules: Mutex<Vec<(String, GitOutput)>>,
    commands: Mutex<Vec<(PathBuf, String)>>,
}

impl MockGitRunner {
    fn new() -> Self {
        Self::default()
    }

    fn on(self, prefix: &str, output: GitOutput) -> Self {
        self.rules.lock().unwrap().push((prefix.to_string(), output));
        self
    }

    fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }
}

#[async_trait::async_trait]
impl GitRunner for MockGitRunner {
    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let line = args.join(" ");
        self.commands
            .lock()
            .unwrap()
            .push((dir.to_path_buf(), line.clone()));

        let mut rules = self.rules.lock().unwrap();
        match rules.iter().position(|(p, _)| line.starts_with(p.as_str())) {
            Some(i) => Ok(rules.remove(i).1),
            None => Ok(GitOutput::ok("")),
        }
    }
}

/// Agent that returns a fixed output and optionally rewrites a file, as a
/// real agent would when resolving conflicts.
struct MockAgent {
    output: AgentOutput,
    write: Option<(PathBuf, String)>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl MockAgent {
    fn replying(stdout: &str) -> Self {
        Self {
            output: AgentOutput {
                success: true,
                stdout: stdout.to_string(),
                exit_code: Some(0),
                ..Default::default()
            },
            write: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn writing(mut self, path: PathBuf, content: &str) -> Self {
        self.write = Some((path, content.to_string()));
        self
    }
}

#[async_trait::async_trait]
impl AgentRunner for MockAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        self.requests.lock().unwrap().push(request);
        if let Some((path, content)) = &self.write {
            std::fs::write(path, content)?;
        }
        Ok(self.output.clone())
    }
}

const CONFLICTED: &str = "fn a() {}\n<<<<<<< HEAD\nlet x = 1;\n=======\nlet x = 2;\n>>>>>>> selfai/task-1-add-dark-mode\n";

fn manager(git: Arc<MockGitRunner>) -> (tempfile::TempDir, WorktreeManager) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join(".selfai_data").join("worktrees");
    let mgr = WorktreeManager::new(dir.path(), root, git).with_min_free_mb(0);
    (dir, mgr)
}

// ===========================================================================
// Create / cleanup
// ===========================================================================

#[tokio::test]
async fn create_cuts_new_branch_from_main() {
    let git = Arc::new(MockGitRunner::new().on("rev-parse --verify", GitOutput::failed("")));
    let (dir, mgr) = manager(git.clone());

    let record = mgr.create_worktree(1, "Add dark mode").await.unwrap();
    assert_eq!(record.branch, "selfai/task-1-add-dark-mode");
    assert_eq!(
        record.path,
        dir.path().join(".selfai_data").join("worktrees").join("task-1")
    );

    let expected = format!(
        "worktree add -b selfai/task-1-add-dark-mode {} main",
        record.path.display()
    );
    assert!(git.commands().contains(&expected), "{:?}", git.commands());
    assert_eq!(mgr.get(1), Some(record));
}

#[tokio::test]
async fn create_reuses_existing_branch() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, mgr) = manager(git.clone());

    let record = mgr.create_worktree(2, "Fix login").await.unwrap();
    let expected = format!(
        "worktree add {} selfai/task-2-fix-login",
        record.path.display()
    );
    assert!(git.commands().contains(&expected), "{:?}", git.commands());
    assert!(!git.ran("worktree add -b"));
}

#[tokio::test]
async fn second_create_for_same_task_conflicts() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, mgr) = manager(git);

    mgr.create_worktree(3, "Task").await.unwrap();
    let err = mgr.create_worktree(3, "Task").await.unwrap_err();
    assert!(matches!(err, WorktreeError::Conflict(3)));
    assert_eq!(mgr.active_worktrees().len(), 1);
}

#[tokio::test]
async fn unreadable_disk_space_refuses_create() {
    let git = Arc::new(MockGitRunner::new());
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("missing");
    let mgr = WorktreeManager::new(&repo, repo.join("worktrees"), git.clone()).with_min_free_mb(0);

    let err = mgr.create_worktree(5, "Task").await.unwrap_err();
    assert!(matches!(err, WorktreeError::DiskCheck(_)));
    assert!(mgr.get(5).is_none());
    assert!(git.commands().is_empty());
}

#[tokio::test]
async fn failed_git_add_releases_reservation() {
    let git = Arc::new(
        MockGitRunner::new()
            .on("worktree add", GitOutput::failed("fatal: invalid reference")),
    );
    let (_dir, mgr) = manager(git);

    let err = mgr.create_worktree(4, "Task").await.unwrap_err();
    assert!(matches!(err, WorktreeError::GitCommand(_)));
    assert!(mgr.get(4).is_none());

    // The rule was consumed, so the retry succeeds.
    mgr.create_worktree(4, "Task").await.unwrap();
}

#[tokio::test]
async fn cleanup_removes_worktree_and_branch() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, mgr) = manager(git.clone());

    mgr.create_worktree(5, "Cleanup me").await.unwrap();
    assert!(mgr.cleanup_worktree(5, true).await);
    assert!(mgr.get(5).is_none());
    assert!(git.ran("worktree remove --force"));
    assert!(git.ran("branch -D selfai/task-5-cleanup-me"));

    assert!(!mgr.cleanup_worktree(5, true).await);
}

#[tokio::test]
async fn release_commits_and_keeps_branch() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, mgr) = manager(git.clone());

    mgr.create_worktree(6, "Add dark mode").await.unwrap();
    assert!(mgr.release_worktree(6, Level::Mvp, "Add dark mode").await.unwrap());

    let cmds = git.commands();
    assert!(cmds.contains(&"add -A".to_string()));
    assert!(cmds.contains(&"commit -m [SelfAI] MVP: Add dark mode\n\nFeature #6".to_string()));
    assert!(!git.ran("branch -D"));
    assert!(mgr.get(6).is_none());

    // Nothing tracked any more.
    assert!(!mgr.release_worktree(6, Level::Mvp, "Add dark mode").await.unwrap());
}

#[tokio::test]
async fn release_tolerates_nothing_to_commit() {
    let git = Arc::new(MockGitRunner::new().on(
        "commit",
        GitOutput {
            success: false,
            stdout: "nothing to commit, working tree clean".into(),
            stderr: String::new(),
        },
    ));
    let (_dir, mgr) = manager(git);

    mgr.create_worktree(7, "Noop").await.unwrap();
    assert!(mgr.release_worktree(7, Level::Enhanced, "Noop").await.unwrap());
}

#[tokio::test]
async fn release_surfaces_real_commit_failures() {
    let git = Arc::new(MockGitRunner::new().on("commit", GitOutput::failed("hook rejected")));
    let (_dir, mgr) = manager(git);

    mgr.create_worktree(8, "Hooked").await.unwrap();
    let err = mgr.release_worktree(8, Level::Mvp, "Hooked").await.unwrap_err();
    assert!(err.to_string().contains("hook rejected"));
    assert!(mgr.get(8).is_some());
}

// ===========================================================================
// Merge
// ===========================================================================

#[tokio::test]
async fn merge_succeeds_even_when_pull_fails() {
    let git = Arc::new(MockGitRunner::new().on("pull", GitOutput::failed("no remote")));
    let (_dir, mgr) = manager(git.clone());

    assert_eq!(mgr.merge_to_main(9, "Ship it").await, MergeOutcome::Merged);
    assert!(git.ran("checkout main"));
    assert!(git
        .commands()
        .contains(&"merge --no-ff selfai/task-9-ship-it -m [SelfAI] Ship it (#9)".to_string()));
}

#[tokio::test]
async fn merge_conflicts_leave_merge_in_progress() {
    let git = Arc::new(
        MockGitRunner::new()
            .on("merge --no-ff", GitOutput::failed("CONFLICT (content)"))
            .on("diff --name-only", GitOutput::ok("src/lib.rs\nREADME.md\n")),
    );
    let (_dir, mgr) = manager(git.clone());

    let outcome = mgr.merge_to_main(10, "Conflicting").await;
    assert_eq!(
        outcome,
        MergeOutcome::Conflicts(vec!["src/lib.rs".into(), "README.md".into()])
    );
    assert!(!git.ran("merge --abort"));
}

#[tokio::test]
async fn non_conflict_merge_failure_aborts() {
    let git = Arc::new(
        MockGitRunner::new().on("merge --no-ff", GitOutput::failed("refusing to merge")),
    );
    let (_dir, mgr) = manager(git.clone());

    let outcome = mgr.merge_to_main(11, "Broken").await;
    assert_eq!(outcome, MergeOutcome::Failed("refusing to merge".into()));
    assert!(git.ran("merge --abort"));
}

#[tokio::test]
async fn checkout_failure_fails_merge() {
    let git = Arc::new(MockGitRunner::new().on("checkout", GitOutput::failed("dirty tree")));
    let (_dir, mgr) = manager(git.clone());

    assert!(matches!(
        mgr.merge_to_main(12, "Dirty").await,
        MergeOutcome::Failed(_)
    ));
    assert!(!git.ran("merge"));
}

// ===========================================================================
// Conflict resolution
// ===========================================================================

#[tokio::test]
async fn agent_resolution_is_committed() {
    let git = Arc::new(MockGitRunner::new());
    let (dir, mgr) = manager(git.clone());
    let file = dir.path().join("lib.rs");
    std::fs::write(&file, CONFLICTED).unwrap();

    let agent = MockAgent::replying("done\nCONFLICTS_RESOLVED\n").writing(file, "fn a() {}\nlet x = 2;\n");
    let files = vec!["lib.rs".to_string()];
    let outcome = mgr
        .resolve_conflicts(1, "Add dark mode", &files, &agent, |conflicted| {
            assert_eq!(conflicted.len(), 1);
            format!("resolve:\n{}", conflicted[0].content)
        })
        .await;

    assert_eq!(outcome, ResolutionOutcome::Resolved);
    let requests = agent.requests.lock().unwrap();
    assert!(requests[0].prompt.contains("<<<<<<< HEAD"));
    assert_eq!(requests[0].allowed_tools, vec!["Read", "Edit", "Bash"]);
    assert_eq!(requests[0].work_dir, dir.path());

    let cmds = git.commands();
    assert!(cmds.contains(&"add -- lib.rs".to_string()));
    assert!(cmds.contains(&"commit -m [SelfAI] Resolve conflicts for #1: Add dark mode".to_string()));
    assert!(!git.ran("merge --abort"));
}

#[tokio::test]
async fn missing_marker_aborts_merge() {
    let git = Arc::new(MockGitRunner::new());
    let (dir, mgr) = manager(git.clone());
    std::fs::write(dir.path().join("lib.rs"), CONFLICTED).unwrap();

    let agent = MockAgent::replying("I looked at it");
    let files = vec!["lib.rs".to_string()];
    let outcome = mgr
        .resolve_conflicts(1, "Add dark mode", &files, &agent, |_| "resolve".into())
        .await;

    assert!(matches!(outcome, ResolutionOutcome::AgentFailed(_)));
    assert!(git.ran("merge --abort"));
    assert!(!git.ran("commit"));
}

#[tokio::test]
async fn leftover_markers_are_unresolved() {
    let git = Arc::new(MockGitRunner::new());
    let (dir, mgr) = manager(git.clone());
    std::fs::write(dir.path().join("lib.rs"), CONFLICTED).unwrap();

    // Claims success without touching the file.
    let agent = MockAgent::replying("CONFLICTS_RESOLVED");
    let files = vec!["lib.rs".to_string()];
    let outcome = mgr
        .resolve_conflicts(1, "Add dark mode", &files, &agent, |_| "resolve".into())
        .await;

    assert_eq!(outcome, ResolutionOutcome::Unresolved(vec!["lib.rs".into()]));
    assert!(git.ran("merge --abort"));
}

#[tokio::test]
async fn still_unmerged_index_is_unresolved() {
    let git = Arc::new(MockGitRunner::new().on("diff --name-only", GitOutput::ok("other.rs\n")));
    let (dir, mgr) = manager(git.clone());
    let file = dir.path().join("lib.rs");
    std::fs::write(&file, CONFLICTED).unwrap();

    let agent = MockAgent::replying("CONFLICTS_RESOLVED").writing(file, "clean\n");
    let files = vec!["lib.rs".to_string()];
    let outcome = mgr
        .resolve_conflicts(1, "Add dark mode", &files, &agent, |_| "resolve".into())
        .await;

    assert_eq!(outcome, ResolutionOutcome::Unresolved(vec!["other.rs".into()]));
    assert!(git.ran("merge --abort"));
}

// ===========================================================================
// Maintenance
// ===========================================================================

#[tokio::test]
async fn prune_removes_only_orphaned_directories() {
    let git = Arc::new(MockGitRunner::new());
    let (dir, mgr) = manager(git.clone());
    let root = dir.path().join(".selfai_data").join("worktrees");

    let tracked = mgr.create_worktree(20, "Tracked").await.unwrap();
    std::fs::create_dir_all(&tracked.path).unwrap();

    let checkout = root.join("task-21");
    std::fs::create_dir_all(&checkout).unwrap();
    std::fs::write(checkout.join(".git"), "gitdir: elsewhere").unwrap();

    let orphan = root.join("task-22");
    std::fs::create_dir_all(orphan.join("src")).unwrap();

    assert_eq!(mgr.prune_orphaned_worktrees().await.unwrap(), 1);
    assert!(!orphan.exists());
    assert!(checkout.exists());
    assert!(tracked.path.exists());
    assert!(git.ran("worktree prune"));
}

#[tokio::test]
async fn prune_without_root_is_noop() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, mgr) = manager(git);
    assert_eq!(mgr.prune_orphaned_worktrees().await.unwrap(), 0);
}

#[tokio::test]
async fn reclaim_stale_skips_tracked_tasks() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, mgr) = manager(git);

    let stale = mgr.worktree_path(30);
    std::fs::create_dir_all(&stale).unwrap();
    assert!(mgr.reclaim_stale(30).await.unwrap());
    assert!(!stale.exists());
    assert!(!mgr.reclaim_stale(30).await.unwrap());

    let record = mgr.create_worktree(31, "Live").await.unwrap();
    std::fs::create_dir_all(&record.path).unwrap();
    assert!(!mgr.reclaim_stale(31).await.unwrap());
    assert!(record.path.exists());
}

#[tokio::test]
async fn discard_keeps_branch_for_earlier_levels() {
    let git = Arc::new(MockGitRunner::new());
    let (_dir, mgr) = manager(git.clone());

    let record = mgr.create_worktree(32, "Second level").await.unwrap();
    std::fs::create_dir_all(&record.path).unwrap();
    assert!(mgr.discard_worktree(32).await);
    assert!(!record.path.exists());
    assert!(!git.ran("branch -D"));
    assert!(!git.ran("commit"));
    assert!(!mgr.discard_worktree(32).await);
}

#[tokio::test]
async fn carry_over_moves_task_branch_to_test_fixes() {
    let git = Arc::new(MockGitRunner::new());
    let (dir, mgr) = manager(git.clone());

    let moved = mgr
        .carry_over(9, "Add dark mode", Level::Mvp, dir.path(), "selfai-test/test-env-9-abcd")
        .await
        .unwrap();
    assert!(moved);
    assert!(git
        .commands()
        .contains(&"commit -m [SelfAI] MVP test fixes: Add dark mode\n\nFeature #9".to_string()));
    assert!(git.ran("branch -f selfai/task-9-add-dark-mode selfai-test/test-env-9-abcd"));
}

#[tokio::test]
async fn carry_over_without_changes_is_a_noop() {
    let git = Arc::new(MockGitRunner::new().on(
        "commit",
        GitOutput {
            success: false,
            stdout: "nothing to commit, working tree clean".into(),
            stderr: String::new(),
        },
    ));
    let (dir, mgr) = manager(git.clone());

    let moved = mgr
        .carry_over(9, "Add dark mode", Level::Mvp, dir.path(), "env-branch")
        .await
        .unwrap();
    assert!(!moved);
    assert!(!git.ran("branch -f"));
}

#[tokio::test]
async fn delete_branch_reports_failure() {
    let git = Arc::new(MockGitRunner::new().on("branch -D", GitOutput::failed("not found")));
    let (_dir, mgr) = manager(git.clone());
    assert!(!mgr.delete_branch(10, "Gone").await);
    assert!(mgr.delete_branch(10, "Gone").await);
    assert!(git.ran("branch -D selfai/task-10-gone"));
}
