use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use sa_agents::PromptRegistry;
use sa_core::agent::{AgentRequest, AgentRunner};
use sa_core::config::Config;
use sa_core::git::{CliGitRunner, GitRunner, RetryPolicy, RetryingGit};
use sa_core::layout::DataLayout;
use sa_core::lockfile::ProcessLock;
use sa_core::store::{StoreLimits, TaskStore};
use sa_core::test_env::{PortAllocator, TestEnvironment, TestEnvironmentManager};
use sa_core::types::{Level, Task, TaskStatus};
use sa_core::verdict;
use sa_core::worktree_manager::{branch_name, MergeOutcome, ResolutionOutcome, WorktreeManager};
use sa_harness::shutdown::ShutdownSignal;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorMetrics, ParallelCoordinator};
use crate::healing::SelfHealingMonitor;

/// Read-only tools for the planning agent.
pub const PLAN_TOOLS: [&str; 3] = ["Read", "Glob", "Grep"];

/// Counts for one pass of [`Orchestrator::run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub orphans_pruned: usize,
    pub requeued: usize,
    pub retries_exhausted: usize,
    pub resumed: usize,
    pub tested: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub tasks_cancelled: usize,
    pub merged: usize,
    pub merge_failures: usize,
    pub planned: usize,
    pub plan_failures: usize,
    pub levels_unlocked: Vec<Level>,
    pub execution: CoordinatorMetrics,
    pub duration_ms: u64,
}

/// Result of testing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestOutcome {
    Passed,
    Failed,
    Cancelled,
    Merged,
    MergeFailed,
    Skipped,
}

struct TesterRun {
    passed: bool,
    output: String,
}

/// Store limits derived from config.
pub fn store_limits(config: &Config) -> StoreLimits {
    StoreLimits {
        max_test_attempts: config.orchestrator.max_test_attempts,
        max_retries: config.orchestrator.max_retries,
        unlock_enhanced: config.levels.level2_unlock_threshold,
        unlock_advanced: config.levels.level3_unlock_threshold,
    }
}

/// The production git runner: the CLI with per-command timeout and retry.
pub fn git_runner(config: &Config) -> Arc<dyn GitRunner> {
    let cli = CliGitRunner::new(Duration::from_secs(config.worktree.git_timeout_secs));
    Arc::new(RetryingGit::new(
        cli,
        RetryPolicy {
            attempts: config.worktree.git_max_attempts,
            base_delay: Duration::from_millis(config.worktree.git_retry_base_delay_ms),
        },
    ))
}

/// Runs the plan / execute / test / merge pipeline against one repository.
pub struct Orchestrator {
    config: Config,
    layout: DataLayout,
    store: Arc<TaskStore>,
    worktrees: Arc<WorktreeManager>,
    test_envs: Arc<TestEnvironmentManager>,
    agent: Arc<dyn AgentRunner>,
    prompts: Arc<PromptRegistry>,
    coordinator: Arc<ParallelCoordinator>,
    merge_lock: Mutex<()>,
    shutdown: ShutdownSignal,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        layout: DataLayout,
        store: Arc<TaskStore>,
        git: Arc<dyn GitRunner>,
        agent: Arc<dyn AgentRunner>,
        prompts: PromptRegistry,
        shutdown: ShutdownSignal,
    ) -> Self {
        let worktrees = Arc::new(
            WorktreeManager::new(layout.repo(), layout.worktrees_dir(), Arc::clone(&git))
                .with_min_free_mb(config.worktree.min_free_disk_mb)
                .with_base_branch(config.worktree.main_branch.clone())
                .with_conflict_timeout(Duration::from_secs(config.worktree.conflict_timeout_secs))
                .with_conflict_tools(config.agent.conflict_tools.clone()),
        );
        let test_envs = Arc::new(
            TestEnvironmentManager::new(&layout, git, config.test_env.max_environments).with_ports(
                PortAllocator::new(config.test_env.port_base, config.test_env.port_range_size),
            ),
        );
        let prompts = Arc::new(prompts);
        let coordinator = Arc::new(
            ParallelCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&worktrees),
                Arc::clone(&agent),
                Arc::clone(&prompts),
                config.orchestrator.max_workers,
            )
            .with_execute_timeout(Duration::from_secs(config.orchestrator.execute_timeout_secs))
            .with_execute_tools(config.agent.execute_tools.clone()),
        );

        Self {
            config,
            layout,
            store,
            worktrees,
            test_envs,
            agent,
            prompts,
            coordinator,
            merge_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Open the task store under the repository's data directory and load
    /// prompt overrides from `<data_dir>/prompts`.
    pub async fn open(
        repo: &Path,
        config: Config,
        git: Arc<dyn GitRunner>,
        agent: Arc<dyn AgentRunner>,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let layout = config.layout(repo);
        layout
            .ensure()
            .with_context(|| format!("failed to create {}", layout.root().display()))?;
        let db = layout.db_path();
        let store = TaskStore::open(&db)
            .await
            .with_context(|| format!("failed to open task store {}", db.display()))?
            .with_limits(store_limits(&config));

        let mut prompts = PromptRegistry::new();
        let overrides = prompts.load_overrides(&layout.root().join("prompts"));
        if overrides > 0 {
            info!(overrides, "prompt overrides loaded");
        }

        Ok(Self::new(config, layout, Arc::new(store), git, agent, prompts, shutdown))
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn worktrees(&self) -> &Arc<WorktreeManager> {
        &self.worktrees
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ParallelCoordinator> {
        &self.coordinator
    }

    /// Start the self-healing monitor when enabled. It stops on `stop`.
    pub async fn spawn_monitor(&self, stop: &ShutdownSignal) -> Option<JoinHandle<()>> {
        if !self.config.healing.enabled {
            debug!("self-healing disabled");
            return None;
        }
        match SelfHealingMonitor::open(
            &self.layout,
            self.config.healing.clone(),
            Arc::clone(&self.worktrees),
            Arc::clone(self.worktrees.git()),
        )
        .await
        {
            Ok(monitor) => Some(Arc::new(monitor).spawn(stop.clone())),
            Err(e) => {
                warn!(error = %e, "self-healing monitor unavailable");
                None
            }
        }
    }

    fn stopping(&self) -> bool {
        if self.shutdown.is_shutting_down() {
            info!("shutdown requested, ending cycle early");
            return true;
        }
        false
    }

    /// One full pass: housekeeping, resume, requeue, test, execute, plan.
    /// Stuck tasks are resumed before any other phase, so a resumed task
    /// that fails again is requeued in the same cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        match self.worktrees.prune_orphaned_worktrees().await {
            Ok(n) => report.orphans_pruned = n,
            Err(e) => warn!(error = %e, "orphaned worktree cleanup failed"),
        }

        if !self.stopping() {
            self.resume_stuck(&mut report).await?;
        }
        if !self.stopping() {
            self.requeue_failed(&mut report).await?;
        }
        if !self.stopping() {
            self.test_ready(&mut report).await?;
        }
        if !self.stopping() {
            let approved = self
                .store
                .approved_batch(self.config.orchestrator.max_workers)
                .await?;
            let metrics = self.coordinator.execute_batch(approved).await;
            report.execution.absorb(&metrics);
        }
        if !self.stopping() {
            self.plan_pending(&mut report).await?;
        }

        report.levels_unlocked = self.store.check_unlocks().await?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            tested = report.tested,
            passed = report.tests_passed,
            merged = report.merged,
            executed = report.execution.tasks_started,
            planned = report.planned,
            duration_ms = report.duration_ms,
            "cycle complete"
        );
        Ok(report)
    }

    /// Failed tasks with no output to test go back to `pending`, or are
    /// cancelled once out of retries.
    async fn requeue_failed(&self, report: &mut CycleReport) -> Result<()> {
        for task in self.store.failed_without_output().await? {
            match self.store.retry(task.id).await {
                Ok(t) if t.status == TaskStatus::Cancelled => report.retries_exhausted += 1,
                Ok(_) => report.requeued += 1,
                Err(e) => warn!(task_id = task.id, error = %e, "requeue failed"),
            }
        }
        Ok(())
    }

    /// Executions left `in_progress` by a crash are started over.
    async fn resume_stuck(&self, report: &mut CycleReport) -> Result<()> {
        let threshold = Duration::from_secs(self.config.orchestrator.stuck_after_secs);
        let stuck = self.store.stuck_tasks(threshold).await?;
        if stuck.is_empty() {
            return Ok(());
        }
        for task in &stuck {
            warn!(task_id = task.id, "resuming stuck task");
            if let Err(e) = self.worktrees.reclaim_stale(task.id).await {
                warn!(task_id = task.id, error = %e, "failed to reclaim stale worktree");
            }
            self.store.clear_worktree(task.id, false).await?;
        }
        report.resumed = stuck.len();
        let stuck = self.reload(stuck).await?;
        let metrics = self.coordinator.execute_batch(stuck).await;
        report.execution.absorb(&metrics);
        Ok(())
    }

    async fn reload(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(self.store.require(task.id).await?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Testing
    // -----------------------------------------------------------------------

    async fn test_ready(&self, report: &mut CycleReport) -> Result<()> {
        let limit = self.config.test_env.max_environments;
        let ready = self.store.ready_for_testing(limit).await?;
        if ready.is_empty() {
            return Ok(());
        }
        info!(count = ready.len(), "testing tasks");

        let results: Vec<(TestOutcome, Option<bool>)> = stream::iter(ready)
            .map(|task| self.test_task(task))
            .buffer_unordered(limit.max(1))
            .collect()
            .await;

        for (outcome, conflict) in results {
            if let Some(resolved) = conflict {
                report.execution.record_conflict(resolved);
            }
            if outcome != TestOutcome::Skipped {
                report.tested += 1;
            }
            match outcome {
                TestOutcome::Passed => report.tests_passed += 1,
                TestOutcome::Failed => report.tests_failed += 1,
                TestOutcome::Cancelled => {
                    report.tests_failed += 1;
                    report.tasks_cancelled += 1;
                }
                TestOutcome::Merged => {
                    report.tests_passed += 1;
                    report.merged += 1;
                }
                TestOutcome::MergeFailed => {
                    report.tests_passed += 1;
                    report.merge_failures += 1;
                }
                TestOutcome::Skipped => {}
            }
        }
        Ok(())
    }

    /// Test the current level in a fresh environment branched from the task
    /// branch. Returns the outcome and, when a merge hit conflicts, whether
    /// they were resolved.
    async fn test_task(&self, task: Task) -> (TestOutcome, Option<bool>) {
        let level = task.current_level;
        let base = task
            .branch
            .clone()
            .unwrap_or_else(|| branch_name(task.id, &task.title));

        let run = match self
            .test_envs
            .scoped(task.id, &base, |env| self.run_tester(&task, env))
            .await
        {
            Ok(run) => run,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "test environment unavailable");
                return (TestOutcome::Skipped, None);
            }
        };

        if !run.passed {
            return match self.store.mark_test_failed(task.id, level, &run.output).await {
                Ok(t) if t.status == TaskStatus::Cancelled => (TestOutcome::Cancelled, None),
                Ok(_) => (TestOutcome::Failed, None),
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "failed to record test failure");
                    (TestOutcome::Skipped, None)
                }
            };
        }

        if level != Level::Advanced {
            return match self.store.mark_test_passed(task.id, level, &run.output).await {
                Ok(_) => (TestOutcome::Passed, None),
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "failed to record test pass");
                    (TestOutcome::Skipped, None)
                }
            };
        }

        self.merge_and_complete(&task, &run.output).await
    }

    async fn run_tester(&self, task: &Task, env: TestEnvironment) -> TesterRun {
        let prompt = self.prompts.test(task, &env.worktree_path);
        let request = AgentRequest::new(
            prompt,
            &env.worktree_path,
            Duration::from_secs(self.config.orchestrator.test_timeout_secs),
        )
        .with_tools(self.config.agent.execute_tools.iter().cloned())
        .with_env(env.as_subprocess_env());

        let output = match self.agent.run(request).await {
            Ok(out) if out.success => out,
            Ok(out) => {
                return TesterRun {
                    passed: false,
                    output: out.failure_reason(),
                }
            }
            Err(e) => {
                return TesterRun {
                    passed: false,
                    output: e.to_string(),
                }
            }
        };

        let verdict = verdict::evaluate(&output.stdout);
        info!(task_id = task.id, env_id = %env.env_id, verdict = ?verdict.verdict, "test finished");
        if !verdict.verdict.is_pass() {
            return TesterRun {
                passed: false,
                output: output.stdout,
            };
        }

        // Fixes the tester made live only in the environment's checkout.
        match self
            .worktrees
            .carry_over(task.id, &task.title, task.current_level, &env.worktree_path, &env.branch)
            .await
        {
            Ok(_) => TesterRun {
                passed: true,
                output: output.stdout,
            },
            Err(e) => TesterRun {
                passed: false,
                output: format!("failed to keep test fixes: {e}"),
            },
        }
    }

    /// Level 3 completion: merge into main first, resolving conflicts with
    /// the agent, and only then record the pass.
    async fn merge_and_complete(&self, task: &Task, output: &str) -> (TestOutcome, Option<bool>) {
        let _merging = self.merge_lock.lock().await;
        let (id, title) = (task.id, task.title.as_str());

        let mut conflict = None;
        let merged = match self.worktrees.merge_to_main(id, title).await {
            MergeOutcome::Merged => Ok(()),
            MergeOutcome::Conflicts(files) => {
                let outcome = self
                    .worktrees
                    .resolve_conflicts(id, title, &files, self.agent.as_ref(), |conflicted| {
                        self.prompts.resolve_conflicts(id, title, conflicted)
                    })
                    .await;
                conflict = Some(outcome == ResolutionOutcome::Resolved);
                match outcome {
                    ResolutionOutcome::Resolved => Ok(()),
                    ResolutionOutcome::Unresolved(remaining) => {
                        Err((remaining, "merge conflicts could not be resolved".to_string()))
                    }
                    ResolutionOutcome::AgentFailed(reason) => {
                        Err((files, format!("conflict resolution failed: {reason}")))
                    }
                }
            }
            MergeOutcome::Failed(message) => Err((Vec::new(), format!("merge failed: {message}"))),
        };

        match merged {
            Ok(()) => {
                if let Err(e) = self.store.mark_test_passed(id, Level::Advanced, output).await {
                    warn!(task_id = id, error = %e, "merged but failed to record completion");
                    return (TestOutcome::Skipped, conflict);
                }
                self.worktrees.delete_branch(id, title).await;
                if let Err(e) = self.store.clear_worktree(id, true).await {
                    warn!(task_id = id, error = %e, "failed to clear branch record");
                }
                info!(task_id = id, "task completed and merged");
                (TestOutcome::Merged, conflict)
            }
            Err((files, message)) => {
                warn!(task_id = id, conflicts = ?files, message = %message, "merge failed");
                if let Err(e) = self.store.mark_merge_failed(id, files, &message).await {
                    warn!(task_id = id, error = %e, "failed to record merge failure");
                }
                (TestOutcome::MergeFailed, conflict)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    async fn plan_pending(&self, report: &mut CycleReport) -> Result<()> {
        let mut unlocked: HashMap<Level, bool> = HashMap::new();
        let mut selected = Vec::new();
        for task in self.store.list(Some(TaskStatus::Pending)).await? {
            if selected.len() >= self.config.orchestrator.max_plans_per_cycle {
                break;
            }
            let level = task.current_level;
            let open = match unlocked.get(&level) {
                Some(open) => *open,
                None => {
                    let open = self.store.is_level_unlocked(level).await?;
                    unlocked.insert(level, open);
                    open
                }
            };
            if open {
                selected.push(task);
            }
        }

        for task in selected {
            if self.shutdown.is_shutting_down() {
                break;
            }
            let task = match self.store.mark_planning(task.id).await {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "task could not enter planning");
                    continue;
                }
            };
            match self.plan_task(&task).await {
                Ok(()) => report.planned += 1,
                Err(e) => {
                    report.plan_failures += 1;
                    warn!(task_id = task.id, error = %e, "planning failed");
                    if let Err(e) = self.store.mark_failed(task.id, &format!("{e:#}")).await {
                        warn!(task_id = task.id, error = %e, "failed to mark task failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn plan_task(&self, task: &Task) -> Result<()> {
        let plan = match self.reusable_plan(task).await? {
            Some(plan) => {
                info!(task_id = task.id, level = %task.current_level, "reusing existing plan");
                plan
            }
            None => self.request_plan(task).await?,
        };
        self.store
            .save_plan(task.id, &plan, self.config.orchestrator.auto_approve_plans)
            .await?;
        info!(
            task_id = task.id,
            level = %task.current_level,
            auto_approved = self.config.orchestrator.auto_approve_plans,
            "plan saved"
        );
        Ok(())
    }

    /// An existing plan for this level, or at MVP the plan of the task this
    /// one was cloned from. Pending feedback always forces a fresh plan.
    async fn reusable_plan(&self, task: &Task) -> Result<Option<String>> {
        if task.feedback.as_deref().is_some_and(|f| !f.trim().is_empty()) {
            return Ok(None);
        }
        if let Some(plan) = task.current_plan().filter(|p| !p.trim().is_empty()) {
            return Ok(Some(plan.to_string()));
        }
        if task.current_level != Level::Mvp {
            return Ok(None);
        }
        let Some(source) = task.original_plan_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .get(source)
            .await?
            .and_then(|t| t.level(Level::Mvp).plan.clone())
            .filter(|p| !p.trim().is_empty()))
    }

    async fn request_plan(&self, task: &Task) -> Result<String> {
        let repo = self.layout.repo();
        let request = AgentRequest::new(
            self.prompts.plan(task, repo),
            repo,
            Duration::from_secs(self.config.orchestrator.plan_timeout_secs),
        )
        .with_tools(PLAN_TOOLS);
        let output = self.agent.run(request).await?;
        if !output.success {
            anyhow::bail!(output.failure_reason());
        }
        let plan = output.stdout.trim();
        if plan.is_empty() {
            anyhow::bail!("agent produced an empty plan");
        }
        Ok(plan.to_string())
    }
}

/// One locked cycle against `repo`, with the healing monitor running
/// alongside it. Lock and store failures are the only errors returned.
pub async fn run_once(
    repo: &Path,
    config: Config,
    git: Arc<dyn GitRunner>,
    agent: Arc<dyn AgentRunner>,
    shutdown: &ShutdownSignal,
) -> Result<CycleReport> {
    let layout = config.layout(repo);
    layout
        .ensure()
        .with_context(|| format!("failed to create {}", layout.root().display()))?;
    let _lock = ProcessLock::new(layout.lock_path())
        .acquire_or_fail()
        .context("failed to acquire runner lock")?;

    let orchestrator = Orchestrator::open(repo, config, git, agent, shutdown.clone()).await?;
    let monitor_stop = ShutdownSignal::new();
    let monitor = orchestrator.spawn_monitor(&monitor_stop).await;

    let report = orchestrator.run_cycle().await;

    monitor_stop.trigger();
    if let Some(handle) = monitor {
        if let Err(e) = handle.await {
            warn!(error = %e, "self-healing monitor task failed");
        }
    }
    report
}
