//! Coordinator and orchestration cycle against a scripted git and agent.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sa_agents::PromptRegistry;
use sa_core::agent::{AgentError, AgentOutput, AgentRequest, AgentRunner};
use sa_core::config::Config;
use sa_core::git::{GitOutput, GitRunner};
use sa_core::layout::DataLayout;
use sa_core::lockfile::ProcessLock;
use sa_core::store::TaskStore;
use sa_core::types::{Level, NewTask, Task, TaskStatus};
use sa_core::worktree_manager::WorktreeManager;
use sa_daemon::coordinator::ParallelCoordinator;
use sa_daemon::orchestrator::{run_once, store_limits, Orchestrator, PLAN_TOOLS};
use sa_harness::shutdown::ShutdownSignal;

// ===========================================================================
// Mocks
// ===========================================================================

/// Records git invocations; scripted responses are matched by prefix and
/// consumed once, everything else succeeds.
#[derive(Default)]
struct MockGitRunner {
    rules: Mutex<Vec<(String, GitOutput)>>,
    commands: Mutex<Vec<String>>,
}

impl MockGitRunner {
    fn on(self, prefix: &str, output: GitOutput) -> Self {
        self.rules.lock().unwrap().push((prefix.to_string(), output));
        self
    }

    fn ran(&self, prefix: &str) -> bool {
        self.commands.lock().unwrap().iter().any(|c| c.starts_with(prefix))
    }
}

#[async_trait::async_trait]
impl GitRunner for MockGitRunner {
    async fn run_git(&self, _dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let line = args.join(" ");
        self.commands.lock().unwrap().push(line.clone());
        let mut rules = self.rules.lock().unwrap();
        match rules.iter().position(|(p, _)| line.starts_with(p.as_str())) {
            Some(i) => Ok(rules.remove(i).1),
            None => Ok(GitOutput::ok("")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Plan,
    Execute,
    Test,
    Resolve,
}

fn phase_of(request: &AgentRequest) -> Phase {
    if request.env.contains_key("SELFAI_ISOLATED_TEST") {
        Phase::Test
    } else if request.allowed_tools == PLAN_TOOLS {
        Phase::Plan
    } else if request.allowed_tools == ["Read", "Edit", "Bash"] {
        Phase::Resolve
    } else {
        Phase::Execute
    }
}

type Handler = dyn Fn(Phase, &AgentRequest) -> AgentOutput + Send + Sync;

struct ScriptedAgent {
    handler: Box<Handler>,
    calls: Mutex<Vec<(Phase, PathBuf)>>,
}

impl ScriptedAgent {
    fn new(handler: impl Fn(Phase, &AgentRequest) -> AgentOutput + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Plans, executes and passes every test.
    fn happy() -> Self {
        Self::new(|phase, _| match phase {
            Phase::Plan => ok("1. add the toggle\n2. persist the choice"),
            Phase::Execute => ok("implemented the toggle"),
            Phase::Test => ok("```json\n{\"test_passed\": true, \"tests_run\": [\"toggle\"]}\n```"),
            Phase::Resolve => ok("nothing to do"),
        })
    }

    fn calls(&self, phase: Phase) -> usize {
        self.calls.lock().unwrap().iter().filter(|(p, _)| *p == phase).count()
    }
}

#[async_trait::async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let phase = phase_of(&request);
        self.calls
            .lock()
            .unwrap()
            .push((phase, request.work_dir.clone()));
        Ok((self.handler)(phase, &request))
    }
}

fn ok(stdout: &str) -> AgentOutput {
    AgentOutput {
        success: true,
        stdout: stdout.to_string(),
        exit_code: Some(0),
        ..Default::default()
    }
}

fn failed(stderr: &str) -> AgentOutput {
    AgentOutput {
        success: false,
        stderr: stderr.to_string(),
        exit_code: Some(1),
        ..Default::default()
    }
}

// ===========================================================================
// Fixtures
// ===========================================================================

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<TaskStore>,
    git: Arc<MockGitRunner>,
    agent: Arc<ScriptedAgent>,
    orchestrator: Orchestrator,
    shutdown: ShutdownSignal,
}

async fn harness_with(git: MockGitRunner, agent: ScriptedAgent, config: Config) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let store = Arc::new(
        TaskStore::open_in_memory()
            .await
            .unwrap()
            .with_limits(store_limits(&config)),
    );
    let git = Arc::new(git);
    let agent = Arc::new(agent);
    let shutdown = ShutdownSignal::new();
    let mut config = config;
    config.worktree.min_free_disk_mb = 0;
    let orchestrator = Orchestrator::new(
        config,
        layout,
        Arc::clone(&store),
        git.clone(),
        agent.clone(),
        PromptRegistry::new(),
        shutdown.clone(),
    );
    Harness {
        _dir: dir,
        store,
        git,
        agent,
        orchestrator,
        shutdown,
    }
}

async fn harness(agent: ScriptedAgent) -> Harness {
    harness_with(MockGitRunner::default(), agent, Config::default()).await
}

/// Plan and approve the current level.
async fn approve(store: &TaskStore, id: i64) -> Task {
    store.mark_planning(id).await.unwrap();
    store.save_plan(id, "do the thing", true).await.unwrap()
}

/// Walk a task through passing levels until it sits at `level`, pending.
async fn advance_to(store: &TaskStore, id: i64, level: Level) {
    while store.require(id).await.unwrap().current_level < level {
        let task = approve(store, id).await;
        store.mark_in_progress(id).await.unwrap();
        store.mark_testing(id, "work").await.unwrap();
        store
            .mark_test_passed(id, task.current_level, "ok")
            .await
            .unwrap();
    }
}

/// A task at `level` in `testing` with output, on a recorded branch.
async fn ready_at(store: &TaskStore, title: &str, level: Level) -> Task {
    let task = store.add(NewTask::new(title)).await.unwrap();
    advance_to(store, task.id, level).await;
    approve(store, task.id).await;
    store.mark_in_progress(task.id).await.unwrap();
    let branch = sa_core::worktree_manager::branch_name(task.id, title);
    store.set_worktree(task.id, "/tmp/gone", &branch).await.unwrap();
    store.clear_worktree(task.id, false).await.unwrap();
    store.mark_testing(task.id, "implemented").await.unwrap()
}

// ===========================================================================
// ParallelCoordinator
// ===========================================================================

fn coordinator(h: &Harness) -> Arc<ParallelCoordinator> {
    let worktrees = Arc::new(
        WorktreeManager::new(
            h.orchestrator.layout().repo(),
            h.orchestrator.layout().worktrees_dir(),
            h.git.clone(),
        )
        .with_min_free_mb(0),
    );
    Arc::new(ParallelCoordinator::new(
        Arc::clone(&h.store),
        worktrees,
        h.agent.clone(),
        Arc::new(PromptRegistry::new()),
        2,
    ))
}

#[tokio::test]
async fn approved_task_executes_into_testing() {
    let h = harness(ScriptedAgent::happy()).await;
    let task = h.store.add(NewTask::new("Add dark mode")).await.unwrap();
    let task = approve(&h.store, task.id).await;

    let metrics = coordinator(&h).execute_batch(vec![task.clone()]).await;
    assert_eq!(metrics.tasks_started, 1);
    assert_eq!(metrics.tasks_completed, 1);
    assert_eq!(metrics.worktrees_created, 1);

    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Testing);
    assert_eq!(task.current().output.as_deref(), Some("implemented the toggle"));
    assert!(task.worktree_path.is_none());
    assert_eq!(task.branch.as_deref(), Some("selfai/task-1-add-dark-mode"));
    assert!(h.git.ran("worktree add -b selfai/task-1-add-dark-mode"));
    assert!(h.git.ran("commit -m [SelfAI] MVP: Add dark mode"));
}

#[tokio::test]
async fn mvp_execution_failure_drops_branch() {
    let h = harness(ScriptedAgent::new(|_, _| failed("model overloaded"))).await;
    let task = h.store.add(NewTask::new("Add dark mode")).await.unwrap();
    let task = approve(&h.store, task.id).await;

    let metrics = coordinator(&h).execute_batch(vec![task.clone()]).await;
    assert_eq!(metrics.tasks_failed, 1);

    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("model overloaded"));
    assert!(task.branch.is_none());
    assert!(h.git.ran("branch -D selfai/task-1-add-dark-mode"));
}

#[tokio::test]
async fn later_level_failure_keeps_branch() {
    let h = harness(ScriptedAgent::new(|_, _| failed("crashed"))).await;
    let task = h.store.add(NewTask::new("Add dark mode")).await.unwrap();
    advance_to(&h.store, task.id, Level::Enhanced).await;
    let task = approve(&h.store, task.id).await;

    coordinator(&h).execute_batch(vec![task.clone()]).await;

    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.current_level, Level::Enhanced);
    assert!(task.branch.is_some());
    assert!(!h.git.ran("branch -D"));
}

#[tokio::test]
async fn invalid_plan_fails_before_any_worktree() {
    let h = harness(ScriptedAgent::happy()).await;
    let task = h.store.add(NewTask::new("Escape")).await.unwrap();
    h.store.mark_planning(task.id).await.unwrap();
    let plan = r#"{"description": "x", "files_to_modify": ["../../etc/passwd"]}"#;
    let task = h.store.save_plan(task.id, plan, true).await.unwrap();

    coordinator(&h).execute_batch(vec![task.clone()]).await;

    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("validation failed"));
    assert!(!h.git.ran("worktree add"));
    assert_eq!(h.agent.calls(Phase::Execute), 0);
}

#[tokio::test]
async fn one_failing_task_does_not_affect_siblings() {
    let h = harness(ScriptedAgent::new(|_, req| {
        if req.work_dir.ends_with("task-2") {
            failed("boom")
        } else {
            ok("done")
        }
    }))
    .await;
    let mut batch = Vec::new();
    for title in ["First", "Second", "Third"] {
        let t = h.store.add(NewTask::new(title)).await.unwrap();
        batch.push(approve(&h.store, t.id).await);
    }

    let metrics = coordinator(&h).execute_batch(batch).await;
    assert_eq!(metrics.tasks_completed, 2);
    assert_eq!(metrics.tasks_failed, 1);

    let statuses: Vec<TaskStatus> = h
        .store
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.status)
        .collect();
    assert_eq!(
        statuses.iter().filter(|s| **s == TaskStatus::Testing).count(),
        2
    );
    assert_eq!(h.store.require(2).await.unwrap().status, TaskStatus::Failed);
}

// ===========================================================================
// Orchestration cycle
// ===========================================================================

#[tokio::test]
async fn cycle_plans_pending_tasks_with_read_only_tools() {
    let h = harness(ScriptedAgent::happy()).await;
    let task = h.store.add(NewTask::new("Add dark mode")).await.unwrap();

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.planned, 1);

    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Approved);
    assert!(task.current_plan().unwrap().contains("add the toggle"));
    assert_eq!(h.agent.calls(Phase::Plan), 1);
}

#[tokio::test]
async fn planning_failure_marks_task_failed() {
    let h = harness(ScriptedAgent::new(|_, _| failed("no credits"))).await;
    let task = h.store.add(NewTask::new("Add dark mode")).await.unwrap();

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.plan_failures, 1);
    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    // The next cycle requeues it (then fails planning again).
    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.requeued, 1);
}

#[tokio::test]
async fn manual_review_holds_plans() {
    let mut config = Config::default();
    config.orchestrator.auto_approve_plans = false;
    let h = harness_with(MockGitRunner::default(), ScriptedAgent::happy(), config).await;
    let task = h.store.add(NewTask::new("Add dark mode")).await.unwrap();

    h.orchestrator.run_cycle().await.unwrap();
    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::PlanReview);

    // Nothing executes until a human approves.
    h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(h.agent.calls(Phase::Execute), 0);
}

#[tokio::test]
async fn original_plan_is_reused_without_asking_the_agent() {
    let h = harness(ScriptedAgent::happy()).await;
    let source = h.store.add(NewTask::new("Original")).await.unwrap();
    h.store.mark_planning(source.id).await.unwrap();
    h.store
        .save_plan(source.id, "the original plan", false)
        .await
        .unwrap();
    let clone = h
        .store
        .add(NewTask::new("Clone").reusing_plan_of(source.id))
        .await
        .unwrap();

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.planned, 1);
    assert_eq!(h.agent.calls(Phase::Plan), 0);
    let clone = h.store.require(clone.id).await.unwrap();
    assert_eq!(clone.current_plan(), Some("the original plan"));
}

#[tokio::test]
async fn mvp_flows_from_plan_to_next_level() {
    let h = harness(ScriptedAgent::happy()).await;
    let task = h.store.add(NewTask::new("Add dark mode")).await.unwrap();

    h.orchestrator.run_cycle().await.unwrap();
    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.execution.tasks_completed, 1);
    assert_eq!(
        h.store.require(task.id).await.unwrap().status,
        TaskStatus::Testing
    );

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.tested, 1);
    assert_eq!(report.tests_passed, 1);

    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.current_level, Level::Enhanced);
    // Enhanced stays locked until enough MVPs pass, so it is not planned yet.
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(h.git.ran("branch -f selfai/task-1-add-dark-mode test/test-env-1-"));
}

#[tokio::test]
async fn failing_test_is_recorded_and_retested() {
    let h = harness(ScriptedAgent::new(|phase, _| match phase {
        Phase::Test => ok(r#"{"test_passed": false, "remaining_issues": ["toggle broken"]}"#),
        _ => ok("done"),
    }))
    .await;
    let task = ready_at(&h.store, "Add dark mode", Level::Mvp).await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.tests_failed, 1);
    let t = h.store.require(task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.current().test_count, 1);
    assert!(!h.git.ran("branch -f"));

    // Attempts run out and the task is cancelled.
    h.orchestrator.run_cycle().await.unwrap();
    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.tasks_cancelled, 1);
    assert_eq!(
        h.store.require(task.id).await.unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn advanced_pass_merges_then_completes() {
    let h = harness(ScriptedAgent::happy()).await;
    let task = ready_at(&h.store, "Add dark mode", Level::Advanced).await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.merged, 1);

    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.branch.is_none());
    assert!(h.git.ran("merge --no-ff selfai/task-1-add-dark-mode"));
    assert!(h.git.ran("branch -D selfai/task-1-add-dark-mode"));
}

#[tokio::test]
async fn unresolved_conflicts_park_the_task() {
    let git = MockGitRunner::default()
        .on("merge --no-ff", GitOutput::failed("CONFLICT (content): src/lib.rs"))
        .on("diff --name-only --diff-filter=U", GitOutput::ok("src/lib.rs\n"));
    let h = harness_with(git, ScriptedAgent::happy(), Config::default()).await;
    let task = ready_at(&h.store, "Add dark mode", Level::Advanced).await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.merge_failures, 1);
    assert_eq!(report.execution.conflicts_detected, 1);
    assert_eq!(report.execution.conflicts_resolved, 0);
    assert_eq!(h.agent.calls(Phase::Resolve), 1);

    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.merge_conflicts, Some(vec!["src/lib.rs".to_string()]));
    assert!(h.git.ran("merge --abort"));

    // Parked tasks are neither re-tested nor requeued.
    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.tested, 0);
    assert_eq!(report.requeued, 0);
}

#[tokio::test]
async fn stuck_tasks_are_resumed() {
    let mut config = Config::default();
    config.orchestrator.stuck_after_secs = 1;
    let h = harness_with(MockGitRunner::default(), ScriptedAgent::happy(), config).await;
    let task = h.store.add(NewTask::new("Add dark mode")).await.unwrap();
    approve(&h.store, task.id).await;
    h.store.mark_in_progress(task.id).await.unwrap();
    h.store
        .set_worktree(task.id, "/tmp/crashed", "selfai/task-1-add-dark-mode")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.execution.tasks_completed, 1);
    // Resumed work is tested in the same cycle.
    assert_eq!(report.tests_passed, 1);
    let task = h.store.require(task.id).await.unwrap();
    assert_eq!(task.current_level, Level::Enhanced);
    assert!(task.level(Level::Mvp).output.is_some());
}

#[tokio::test]
async fn stuck_tasks_are_resumed_before_failed_ones_are_requeued() {
    let mut config = Config::default();
    config.orchestrator.stuck_after_secs = 1;
    let agent = ScriptedAgent::new(|phase, _| match phase {
        Phase::Execute => failed("crashed again"),
        _ => ok("1. retry the work"),
    });
    let h = harness_with(MockGitRunner::default(), agent, config).await;

    let stuck = h.store.add(NewTask::new("Stuck")).await.unwrap();
    approve(&h.store, stuck.id).await;
    h.store.mark_in_progress(stuck.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let failed_task = h.store.add(NewTask::new("Already failed")).await.unwrap();
    approve(&h.store, failed_task.id).await;
    h.store.mark_in_progress(failed_task.id).await.unwrap();
    h.store.mark_failed(failed_task.id, "agent error").await.unwrap();

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.execution.tasks_failed, 1);
    // The resumed task failed first, so the requeue phase saw both.
    assert_eq!(report.requeued, 2);
    assert_eq!(h.store.require(stuck.id).await.unwrap().retry_count, 1);
    assert_eq!(h.store.require(failed_task.id).await.unwrap().retry_count, 1);

    let calls = h.agent.calls.lock().unwrap();
    assert_eq!(calls[0].0, Phase::Execute);
    assert!(calls[1..].iter().all(|(p, _)| *p == Phase::Plan));
}

#[tokio::test]
async fn shutdown_ends_cycle_before_work_starts() {
    let h = harness(ScriptedAgent::happy()).await;
    h.store.add(NewTask::new("Add dark mode")).await.unwrap();
    h.shutdown.trigger();

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.planned, 0);
    assert_eq!(h.agent.calls(Phase::Plan), 0);
}

#[tokio::test]
async fn run_once_refuses_when_lock_is_held() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let layout = config.layout(dir.path());
    layout.ensure().unwrap();
    let _held = ProcessLock::new(layout.lock_path()).acquire_or_fail().unwrap();

    let err = run_once(
        dir.path(),
        config,
        Arc::new(MockGitRunner::default()),
        Arc::new(ScriptedAgent::happy()),
        &ShutdownSignal::new(),
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("runner lock"));
}

#[tokio::test]
async fn run_once_runs_a_locked_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.worktree.min_free_disk_mb = 0;
    let layout = config.layout(dir.path());

    let report = run_once(
        dir.path(),
        config,
        Arc::new(MockGitRunner::default()),
        Arc::new(ScriptedAgent::happy()),
        &ShutdownSignal::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.planned, 0);
    assert!(layout.db_path().exists());
    assert!(layout.healing_db_path().exists());
    assert!(!layout.lock_path().exists());
}
