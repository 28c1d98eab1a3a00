use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of failed test runs at one level before a task is cancelled.
pub const MAX_TEST_ATTEMPTS: u32 = 3;

/// Error text stored on a task that exhausted its test attempts.
pub const CANCELLED_MESSAGE: &str =
    "Maximum test attempts reached; task cancelled and awaiting re-enable";

/// Longest error message persisted on a task.
pub const MAX_ERROR_LEN: usize = 500;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    PlanReview,
    Approved,
    InProgress,
    Testing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::Planning,
        TaskStatus::PlanReview,
        TaskStatus::Approved,
        TaskStatus::InProgress,
        TaskStatus::Testing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Planning)
                | (TaskStatus::Planning, TaskStatus::PlanReview)
                | (TaskStatus::Planning, TaskStatus::Failed)
                | (TaskStatus::PlanReview, TaskStatus::Approved)
                | (TaskStatus::PlanReview, TaskStatus::Pending)
                | (TaskStatus::Approved, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Testing)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Testing, TaskStatus::Completed)
                | (TaskStatus::Testing, TaskStatus::Failed)
                | (TaskStatus::Testing, TaskStatus::Cancelled)
                | (TaskStatus::Failed, TaskStatus::Pending)
                | (TaskStatus::Failed, TaskStatus::Cancelled)
                | (TaskStatus::Cancelled, TaskStatus::Pending)
        )
    }

    /// Statuses from which a test verdict may be recorded. A `Failed` task
    /// with output is re-tested without re-executing.
    pub fn accepts_test_result(&self) -> bool {
        matches!(self, TaskStatus::Testing | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::PlanReview => "plan_review",
            TaskStatus::Approved => "approved",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Testing => "testing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        TaskStatus::ALL.into_iter().find(|s| s.as_str() == raw)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// Implementation rigor tier. Every task passes MVP, Enhanced and Advanced in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Mvp = 1,
    Enhanced = 2,
    Advanced = 3,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Mvp, Level::Enhanced, Level::Advanced];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: i64) -> Option<Level> {
        match n {
            1 => Some(Level::Mvp),
            2 => Some(Level::Enhanced),
            3 => Some(Level::Advanced),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Level> {
        match self {
            Level::Mvp => Some(Level::Enhanced),
            Level::Enhanced => Some(Level::Advanced),
            Level::Advanced => None,
        }
    }

    pub fn previous(self) -> Option<Level> {
        match self {
            Level::Mvp => None,
            Level::Enhanced => Some(Level::Mvp),
            Level::Advanced => Some(Level::Enhanced),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Level::Mvp => "MVP",
            Level::Enhanced => "Enhanced",
            Level::Advanced => "Advanced",
        }
    }

    fn index(self) -> usize {
        self as usize - 1
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    Testing,
    Completed,
}

impl LevelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelStatus::Pending => "pending",
            LevelStatus::Testing => "testing",
            LevelStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(LevelStatus::Pending),
            "testing" => Some(LevelStatus::Testing),
            "completed" => Some(LevelStatus::Completed),
            _ => None,
        }
    }
}

/// Per-level progress: plan, output, test output and attempt counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelState {
    pub status: LevelStatus,
    pub plan: Option<String>,
    pub output: Option<String>,
    pub test_output: Option<String>,
    pub test_count: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

impl Default for LevelState {
    fn default() -> Self {
        Self {
            status: LevelStatus::Pending,
            plan: None,
            output: None,
            test_output: None,
            test_count: 0,
            completed_at: None,
            duration_secs: None,
        }
    }
}

impl LevelState {
    pub fn has_output(&self) -> bool {
        self.output.as_deref().is_some_and(|o| !o.trim().is_empty())
    }

    pub fn has_plan(&self) -> bool {
        self.plan.as_deref().is_some_and(|p| !p.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition for task #{task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("validation failed for task #{task_id}: {reason}")]
    Validation { task_id: i64, reason: String },
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Fields supplied when adding a task to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: i64,
    pub source: String,
    pub original_plan_id: Option<i64>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            category: "general".to_string(),
            priority: 50,
            source: "user".to_string(),
            original_plan_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn reusing_plan_of(mut self, task_id: i64) -> Self {
        self.original_plan_id = Some(task_id);
        self
    }
}

/// One improvement task and its full lifecycle state.
///
/// Status changes go through the named methods below; each checks the
/// transition table and leaves the task untouched on error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: i64,
    pub source: String,
    pub status: TaskStatus,
    pub current_level: Level,
    pub levels: [LevelState; 3],
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    pub original_plan_id: Option<i64>,
    pub merge_conflicts: Option<Vec<String>>,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl Task {
    /// Build a fresh `Pending` task at MVP level.
    pub fn from_new(id: i64, new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: new.title,
            description: new.description,
            category: new.category,
            priority: new.priority,
            source: new.source,
            status: TaskStatus::Pending,
            current_level: Level::Mvp,
            levels: Default::default(),
            worktree_path: None,
            branch: None,
            original_plan_id: new.original_plan_id,
            merge_conflicts: None,
            feedback: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
        }
    }

    pub fn level(&self, level: Level) -> &LevelState {
        &self.levels[level.index()]
    }

    pub fn level_mut(&mut self, level: Level) -> &mut LevelState {
        &mut self.levels[level.index()]
    }

    pub fn current(&self) -> &LevelState {
        self.level(self.current_level)
    }

    /// Current-level plan, if one has been saved.
    pub fn current_plan(&self) -> Option<&str> {
        self.current().plan.as_deref().filter(|p| !p.trim().is_empty())
    }

    pub fn is_ready_for_testing(&self, max_attempts: u32) -> bool {
        self.status.accepts_test_result()
            && self.merge_conflicts.is_none()
            && self.current().test_count < max_attempts
            && self.current().has_output()
    }

    fn invalid(&self, to: TaskStatus) -> TransitionError {
        TransitionError::InvalidTransition {
            task_id: self.id,
            from: self.status,
            to,
        }
    }

    fn validation(&self, reason: impl Into<String>) -> TransitionError {
        TransitionError::Validation {
            task_id: self.id,
            reason: reason.into(),
        }
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(&to) {
            return Err(self.invalid(to));
        }
        self.status = to;
        Ok(())
    }

    /// Test verdicts arrive on `Testing` tasks or on `Failed` tasks being
    /// re-tested. The level advance back to `Pending` is not a table edge;
    /// it is owned by `mark_test_passed`.
    fn check_test_result(&self, level: Level, to: TaskStatus) -> Result<(), TransitionError> {
        let edge_ok = to == TaskStatus::Pending || TaskStatus::Testing.can_transition_to(&to);
        if !self.status.accepts_test_result() || !edge_ok {
            return Err(self.invalid(to));
        }
        if level != self.current_level {
            return Err(self.validation(format!(
                "test result for level {} but task is at level {}",
                level, self.current_level
            )));
        }
        if !self.level(level).has_output() {
            return Err(self.validation(format!("level {level} has no output to test")));
        }
        Ok(())
    }

    pub fn mark_planning(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Planning)
    }

    /// Store the plan for the current level and move to review, or straight
    /// through to `Approved` when `auto_approve` is set.
    pub fn save_plan(&mut self, plan: &str, auto_approve: bool) -> Result<(), TransitionError> {
        if plan.trim().is_empty() {
            return Err(self.validation("plan is empty"));
        }
        if self.status != TaskStatus::Planning {
            return Err(self.invalid(TaskStatus::PlanReview));
        }
        let level = self.current_level;
        self.level_mut(level).plan = Some(plan.to_string());
        self.status = TaskStatus::PlanReview;
        self.feedback = None;
        if auto_approve {
            self.transition(TaskStatus::Approved)?;
        }
        Ok(())
    }

    pub fn approve(&mut self) -> Result<(), TransitionError> {
        if self.status == TaskStatus::PlanReview && !self.current().has_plan() {
            return Err(self.validation("no plan to approve"));
        }
        self.transition(TaskStatus::Approved)
    }

    pub fn request_feedback(&mut self, feedback: &str) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Pending)?;
        self.feedback = Some(feedback.trim().to_string()).filter(|f| !f.is_empty());
        Ok(())
    }

    /// Start execution. An `InProgress` task is being resumed after a crash;
    /// only its start time is refreshed.
    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != TaskStatus::InProgress {
            self.transition(TaskStatus::InProgress)?;
        }
        self.started_at = Some(now);
        self.error = None;
        Ok(())
    }

    pub fn mark_testing(&mut self, output: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(&TaskStatus::Testing) {
            return Err(self.invalid(TaskStatus::Testing));
        }
        if output.trim().is_empty() {
            return Err(self.validation(format!(
                "level {} produced no output",
                self.current_level
            )));
        }
        let duration = self.started_at.map(|s| (now - s).num_seconds());
        let level = self.current_level;
        let state = self.level_mut(level);
        state.output = Some(output.to_string());
        state.status = LevelStatus::Testing;
        state.duration_secs = duration;
        self.status = TaskStatus::Testing;
        Ok(())
    }

    /// Record a passing test. Below Advanced this advances `current_level`
    /// and returns the task to `Pending` for the next level's plan.
    pub fn mark_test_passed(
        &mut self,
        level: Level,
        output: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let target = match level.next() {
            Some(_) => TaskStatus::Pending,
            None => TaskStatus::Completed,
        };
        self.check_test_result(level, target)?;

        let state = self.level_mut(level);
        state.status = LevelStatus::Completed;
        state.test_output = Some(output.to_string());
        state.completed_at = Some(now);

        match level.next() {
            Some(next) => {
                self.current_level = next;
                *self.level_mut(next) = LevelState::default();
                self.status = TaskStatus::Pending;
                self.started_at = None;
            }
            None => {
                self.status = TaskStatus::Completed;
                self.completed_at = Some(now);
                self.merge_conflicts = None;
            }
        }
        self.error = None;
        Ok(())
    }

    /// Record a failing test. Returns the resulting status: `Failed`, or
    /// `Cancelled` once the level's counter reaches `max_attempts`.
    pub fn mark_test_failed(
        &mut self,
        level: Level,
        output: &str,
        max_attempts: u32,
    ) -> Result<TaskStatus, TransitionError> {
        let count = self.level(level).test_count.saturating_add(1).min(max_attempts);
        let target = if count >= max_attempts {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        self.check_test_result(level, target)?;

        let state = self.level_mut(level);
        state.test_count = count;
        state.test_output = Some(output.to_string());
        state.status = LevelStatus::Testing;
        self.retry_count = self.retry_count.saturating_add(1);
        self.status = target;
        self.error = Some(if target == TaskStatus::Cancelled {
            CANCELLED_MESSAGE.to_string()
        } else {
            format!("{level} test failed (attempt {count}/{max_attempts})")
        });
        Ok(target)
    }

    /// Record an execution, planning or timeout failure.
    pub fn mark_failed(&mut self, error: &str) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(truncate_message(error, MAX_ERROR_LEN));
        self.retry_count = self.retry_count.saturating_add(1);
        Ok(())
    }

    /// A passing Advanced task whose branch could not be merged.
    pub fn mark_merge_failed(
        &mut self,
        conflicts: Vec<String>,
        message: &str,
    ) -> Result<(), TransitionError> {
        if !self.status.accepts_test_result() || self.current_level != Level::Advanced {
            return Err(self.invalid(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.merge_conflicts = Some(conflicts);
        self.error = Some(truncate_message(message, MAX_ERROR_LEN));
        Ok(())
    }

    /// Return a failed task to `Pending`, or cancel it once `max_retries`
    /// is reached. Returns the resulting status.
    pub fn retry(&mut self, max_retries: u32) -> Result<TaskStatus, TransitionError> {
        if self.status != TaskStatus::Failed {
            return Err(self.invalid(TaskStatus::Pending));
        }
        if self.retry_count >= max_retries {
            self.transition(TaskStatus::Cancelled)?;
            self.error = Some(format!(
                "Retry limit reached after {} attempts",
                self.retry_count
            ));
            return Ok(TaskStatus::Cancelled);
        }
        self.transition(TaskStatus::Pending)?;
        self.merge_conflicts = None;
        Ok(TaskStatus::Pending)
    }

    /// The only way out of `Cancelled`: resets counters, clears the error
    /// and keeps the feedback for the next plan.
    pub fn reenable(&mut self, feedback: Option<&str>) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Cancelled {
            return Err(self.invalid(TaskStatus::Pending));
        }
        self.transition(TaskStatus::Pending)?;
        for state in self.levels.iter_mut() {
            state.test_count = 0;
        }
        self.retry_count = 0;
        self.error = None;
        self.merge_conflicts = None;
        self.feedback = feedback
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        Ok(())
    }
}

/// Truncate `message` to at most `max` bytes on a char boundary.
pub fn truncate_message(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: u64,
    pub pending: u64,
    pub planning: u64,
    pub plan_review: u64,
    pub approved: u64,
    pub in_progress: u64,
    pub testing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskStats {
    pub fn count(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Planning => self.planning,
            TaskStatus::PlanReview => self.plan_review,
            TaskStatus::Approved => self.approved,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Testing => self.testing,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    pub(crate) fn add(&mut self, status: TaskStatus, n: u64) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Planning => &mut self.planning,
            TaskStatus::PlanReview => &mut self.plan_review,
            TaskStatus::Approved => &mut self.approved,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Testing => &mut self.testing,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
        self.total += n;
    }
}

/// Per-level progress counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelStats {
    pub level: Level,
    /// Tasks whose test at this level passed.
    pub passed: u64,
    /// Tasks currently at this level somewhere between planning and testing.
    pub in_progress: u64,
    /// Tasks at this level waiting to be planned.
    pub pending: u64,
}

/// How close a level is to being unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockProgress {
    pub level: Level,
    pub completed: u64,
    pub threshold: u64,
}

impl UnlockProgress {
    pub fn is_unlocked(&self) -> bool {
        self.completed >= self.threshold
    }
}

/// Expected time left for an executing or testing task, based on how long
/// the same level took on average for completed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEstimate {
    pub task_id: i64,
    pub title: String,
    pub level: Level,
    pub status: TaskStatus,
    pub elapsed_secs: i64,
    /// `None` while no task has completed this level. Never negative.
    pub remaining_secs: Option<i64>,
}

impl TimeEstimate {
    /// `None` unless the task is `InProgress` or `Testing` with a start time.
    pub fn for_task(task: &Task, average_secs: Option<f64>, now: DateTime<Utc>) -> Option<Self> {
        if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Testing) {
            return None;
        }
        let started = task.started_at?;
        let elapsed_secs = (now - started).num_seconds().max(0);
        let remaining_secs = average_secs.map(|avg| (avg - elapsed_secs as f64).max(0.0).round() as i64);
        Some(Self {
            task_id: task.id,
            title: task.title.clone(),
            level: task.current_level,
            status: task.status,
            elapsed_secs,
            remaining_secs,
        })
    }
}
