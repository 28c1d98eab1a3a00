use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use sa_agents::PromptRegistry;
use sa_core::agent::{AgentError, AgentRequest, AgentRunner};
use sa_core::plan::validate_plan;
use sa_core::store::{StoreError, TaskStore};
use sa_core::types::{Level, Task};
use sa_core::worktree_manager::{WorktreeError, WorktreeManager};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::scheduler::TaskScheduler;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why one task's execution stopped. Always absorbed into the task's
/// `failed` state, never propagated to the batch.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("validation failed for task #{task_id}: {reason}")]
    Validation { task_id: i64, reason: String },
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("worktree: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("{0}")]
    Agent(#[from] AgentError),
    #[error("{0}")]
    AgentFailed(String),
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub worktrees_created: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
}

impl CoordinatorMetrics {
    pub fn absorb(&mut self, other: &CoordinatorMetrics) {
        self.tasks_started += other.tasks_started;
        self.tasks_completed += other.tasks_completed;
        self.tasks_failed += other.tasks_failed;
        self.worktrees_created += other.worktrees_created;
        self.conflicts_detected += other.conflicts_detected;
        self.conflicts_resolved += other.conflicts_resolved;
    }

    /// Count a merge that stopped on conflicts, and whether they were
    /// resolved automatically.
    pub fn record_conflict(&mut self, resolved: bool) {
        self.conflicts_detected += 1;
        if resolved {
            self.conflicts_resolved += 1;
        }
    }

    fn record(&mut self, report: &TaskReport) {
        if report.worktree_created {
            self.worktrees_created += 1;
        }
        match report.outcome {
            TaskOutcome::Testing => {
                self.tasks_started += 1;
                self.tasks_completed += 1;
            }
            TaskOutcome::Failed(_) => {
                self.tasks_started += 1;
                self.tasks_failed += 1;
            }
            TaskOutcome::Skipped(_) => {}
        }
    }
}

/// What happened to one dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Execution succeeded; the task awaits testing.
    Testing,
    /// The task was marked failed with this reason.
    Failed(String),
    /// The task could not be started (it changed state under us).
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_id: i64,
    pub outcome: TaskOutcome,
    pub worktree_created: bool,
}

// ---------------------------------------------------------------------------
// ParallelCoordinator
// ---------------------------------------------------------------------------

/// Drives approved tasks through worktree-isolated execution with a
/// bounded number of concurrent workers.
pub struct ParallelCoordinator {
    store: Arc<TaskStore>,
    worktrees: Arc<WorktreeManager>,
    agent: Arc<dyn AgentRunner>,
    prompts: Arc<PromptRegistry>,
    scheduler: TaskScheduler,
    repo: PathBuf,
    execute_timeout: Duration,
    execute_tools: Vec<String>,
}

impl ParallelCoordinator {
    pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(900);

    pub fn new(
        store: Arc<TaskStore>,
        worktrees: Arc<WorktreeManager>,
        agent: Arc<dyn AgentRunner>,
        prompts: Arc<PromptRegistry>,
        max_workers: usize,
    ) -> Self {
        let repo = worktrees.repo().to_path_buf();
        Self {
            store,
            worktrees,
            agent,
            prompts,
            scheduler: TaskScheduler::new(max_workers),
            repo,
            execute_timeout: Self::DEFAULT_EXECUTE_TIMEOUT,
            execute_tools: Vec::new(),
        }
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_execute_tools(mut self, tools: Vec<String>) -> Self {
        self.execute_tools = tools;
        self
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Execute a batch concurrently. Every task's outcome is resolved on its
    /// own; a failing or panicking task never affects its siblings.
    pub async fn execute_batch(self: &Arc<Self>, mut tasks: Vec<Task>) -> CoordinatorMetrics {
        let mut metrics = CoordinatorMetrics::default();
        if tasks.is_empty() {
            return metrics;
        }
        self.scheduler.prioritize(&mut tasks);
        info!(
            batch = tasks.len(),
            workers = self.scheduler.max_workers(),
            "executing batch"
        );

        let mut set = JoinSet::new();
        for task in tasks {
            let this = Arc::clone(self);
            let gate = self.scheduler.concurrency_gate();
            set.spawn(async move {
                let _permit = gate.acquire_owned().await.ok();
                let task_id = task.id;
                match AssertUnwindSafe(this.execute_task(&task)).catch_unwind().await {
                    Ok(report) => report,
                    Err(_) => {
                        error!(task_id, "task execution panicked");
                        this.fail(&task, "execution panicked").await
                    }
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => metrics.record(&report),
                Err(e) => {
                    error!(error = %e, "worker join failed");
                    metrics.tasks_failed += 1;
                }
            }
        }

        info!(
            started = metrics.tasks_started,
            completed = metrics.tasks_completed,
            failed = metrics.tasks_failed,
            worktrees = metrics.worktrees_created,
            "batch finished"
        );
        metrics
    }

    /// Run one task from `approved` (or a stuck `in_progress`) to `testing`
    /// or `failed`.
    pub async fn execute_task(&self, task: &Task) -> TaskReport {
        let task = match self.store.mark_in_progress(task.id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "task could not be started");
                return TaskReport {
                    task_id: task.id,
                    outcome: TaskOutcome::Skipped(e.to_string()),
                    worktree_created: false,
                };
            }
        };

        let mut worktree_created = false;
        match self.run_in_worktree(&task, &mut worktree_created).await {
            Ok(()) => {
                info!(task_id = task.id, level = %task.current_level, "task ready for testing");
                TaskReport {
                    task_id: task.id,
                    outcome: TaskOutcome::Testing,
                    worktree_created,
                }
            }
            Err(e) => {
                let mut report = self.fail(&task, &e.to_string()).await;
                report.worktree_created = worktree_created;
                report
            }
        }
    }

    async fn run_in_worktree(
        &self,
        task: &Task,
        worktree_created: &mut bool,
    ) -> Result<(), CoordinatorError> {
        let plan = self.validate(task)?;

        let record = self.worktrees.create_worktree(task.id, &task.title).await?;
        *worktree_created = true;
        self.store
            .set_worktree(task.id, &record.path.to_string_lossy(), &record.branch)
            .await?;

        let prompt = self.prompts.execute(task, &plan, &record.path);
        let request = AgentRequest::new(prompt, &record.path, self.execute_timeout)
            .with_tools(self.execute_tools.iter().cloned());
        let output = self.agent.run(request).await?;
        if !output.success {
            return Err(CoordinatorError::AgentFailed(output.failure_reason()));
        }
        if output.stdout.trim().is_empty() {
            return Err(CoordinatorError::AgentFailed("agent produced no output".into()));
        }

        self.worktrees
            .release_worktree(task.id, task.current_level, &task.title)
            .await?;
        self.store.clear_worktree(task.id, false).await?;
        self.store.mark_testing(task.id, &output.stdout).await?;
        Ok(())
    }

    /// An approved plan that passes validation, and no leftover worktree.
    fn validate(&self, task: &Task) -> Result<String, CoordinatorError> {
        let invalid = |reason: String| CoordinatorError::Validation {
            task_id: task.id,
            reason,
        };
        let plan = task
            .current_plan()
            .ok_or_else(|| invalid(format!("no approved plan for level {}", task.current_level)))?;
        if task.worktree_path.is_some() || self.worktrees.get(task.id).is_some() {
            return Err(invalid("worktree already exists".into()));
        }
        validate_plan(plan, &self.repo).map_err(|e| invalid(e.to_string()))?;
        Ok(plan.to_string())
    }

    /// Mark the task failed and remove every trace of the attempt. At MVP
    /// the branch goes too; later levels keep the work already committed.
    async fn fail(&self, task: &Task, reason: &str) -> TaskReport {
        warn!(task_id = task.id, reason, "task execution failed");

        let drop_branch = task.current_level == Level::Mvp;
        if drop_branch {
            self.worktrees.cleanup_worktree(task.id, true).await;
        } else {
            self.worktrees.discard_worktree(task.id).await;
        }
        if let Err(e) = self.store.clear_worktree(task.id, drop_branch).await {
            warn!(task_id = task.id, error = %e, "failed to clear worktree record");
        }
        if let Err(e) = self.store.mark_failed(task.id, reason).await {
            warn!(task_id = task.id, error = %e, "failed to mark task failed");
        }

        TaskReport {
            task_id: task.id,
            outcome: TaskOutcome::Failed(reason.to_string()),
            worktree_created: false,
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }
}
