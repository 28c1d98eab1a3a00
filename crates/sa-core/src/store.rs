use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::types::{
    Level, LevelState, LevelStats, LevelStatus, NewTask, Task, TaskStats, TaskStatus,
    TimeEstimate, TransitionError, UnlockProgress, MAX_TEST_ATTEMPTS,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid transition for task #{task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("validation: {0}")]
    Validation(String),
    #[error("task #{0} not found")]
    NotFound(i64),
    #[error("duplicate task title: {0}")]
    Duplicate(String),
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

impl From<TransitionError> for StoreError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidTransition { task_id, from, to } => {
                StoreError::InvalidTransition { task_id, from, to }
            }
            TransitionError::Validation { reason, .. } => StoreError::Validation(reason),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Counters and thresholds the store enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_test_attempts: u32,
    pub max_retries: u32,
    /// Level 1 passes required before Enhanced work is planned.
    pub unlock_enhanced: u64,
    /// Level 2 passes required before Advanced work is planned.
    pub unlock_advanced: u64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_test_attempts: MAX_TEST_ATTEMPTS,
            max_retries: 5,
            unlock_enhanced: 5,
            unlock_advanced: 10,
        }
    }
}

/// A level that crossed its unlock threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockEvent {
    pub level: Level,
    pub unlocked_at: DateTime<Utc>,
    pub tasks_completed: u64,
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Durable SQLite store for tasks, per-level state and unlock events.
///
/// Every status change runs inside one transaction: the row is loaded, the
/// matching [`Task`] method validates and applies the change, and the result
/// is written back. A rejected change leaves the row untouched.
pub struct TaskStore {
    conn: Connection,
    limits: StoreLimits,
}

impl TaskStore {
    /// Open (or create) a store at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self {
            conn,
            limits: StoreLimits::default(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory store (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self {
            conn,
            limits: StoreLimits::default(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id               INTEGER PRIMARY KEY AUTOINCREMENT,
                        title            TEXT NOT NULL UNIQUE,
                        description      TEXT NOT NULL DEFAULT '',
                        category         TEXT NOT NULL DEFAULT 'general',
                        priority         INTEGER NOT NULL DEFAULT 50,
                        source           TEXT NOT NULL DEFAULT 'user',
                        status           TEXT NOT NULL,
                        current_level    INTEGER NOT NULL DEFAULT 1,
                        worktree_path    TEXT,
                        branch           TEXT,
                        original_plan_id INTEGER,
                        merge_conflicts  TEXT,
                        feedback         TEXT,
                        created_at       TEXT NOT NULL,
                        started_at       TEXT,
                        completed_at     TEXT,
                        error            TEXT,
                        retry_count      INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_level  ON tasks(current_level);

                    CREATE TABLE IF NOT EXISTS task_levels (
                        task_id       INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                        level         INTEGER NOT NULL,
                        status        TEXT NOT NULL DEFAULT 'pending',
                        plan          TEXT,
                        output        TEXT,
                        test_output   TEXT,
                        test_count    INTEGER NOT NULL DEFAULT 0,
                        completed_at  TEXT,
                        duration_secs INTEGER,
                        PRIMARY KEY (task_id, level)
                    );

                    CREATE TABLE IF NOT EXISTS unlock_events (
                        id              INTEGER PRIMARY KEY AUTOINCREMENT,
                        level           INTEGER NOT NULL UNIQUE,
                        unlocked_at     TEXT NOT NULL,
                        tasks_completed INTEGER NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Creation and lookup
    // -----------------------------------------------------------------------

    /// Insert a new `Pending` task at MVP level.
    pub async fn add(&self, new: NewTask) -> Result<Task> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(StoreError::Validation("title must not be empty".into()));
        }
        let new = NewTask { title, ..new };
        let now = now();

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tasks WHERE title = ?1)",
                    rusqlite::params![new.title],
                    |r| r.get(0),
                )?;
                if exists {
                    return Ok(Err(StoreError::Duplicate(new.title)));
                }
                tx.execute(
                    "INSERT INTO tasks (title, description, category, priority, source,
                        status, current_level, original_plan_id, created_at, retry_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 1, ?6, ?7, 0)",
                    rusqlite::params![
                        new.title,
                        new.description,
                        new.category,
                        new.priority,
                        new.source,
                        new.original_plan_id,
                        ts(&now),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                let task = Task::from_new(id, new, now);
                write_levels(&tx, &task)?;
                tx.commit()?;
                Ok(Ok(task))
            })
            .await?;

        if let Ok(task) = &outcome {
            info!(task_id = task.id, title = %task.title, "task added");
        }
        outcome
    }

    pub async fn get(&self, id: i64) -> Result<Option<Task>> {
        Ok(self.conn.call(move |conn| Ok(load_task(conn, id)?)).await?)
    }

    /// Like [`get`](Self::get) but a missing task is an error.
    pub async fn require(&self, id: i64) -> Result<Task> {
        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }

    /// Whether a task with this exact (trimmed) title is already queued.
    pub async fn exists(&self, title: &str) -> Result<bool> {
        let title = title.trim().to_string();
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tasks WHERE title = ?1)",
                    rusqlite::params![title],
                    |r| r.get(0),
                )?)
            })
            .await?)
    }

    /// All tasks, optionally filtered by status, highest priority first.
    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let filter = status.map(|s| s.as_str().to_string());
        self.query_tasks(
            "SELECT id FROM tasks WHERE (?1 IS NULL OR status = ?1)
             ORDER BY priority DESC, created_at ASC, id ASC",
            move |stmt| collect_ids(stmt.query(rusqlite::params![filter])?),
        )
        .await
    }

    /// Highest-priority pending task, oldest first among equals.
    pub async fn next_pending(&self) -> Result<Option<Task>> {
        Ok(self.pending_batch(1).await?.into_iter().next())
    }

    pub async fn pending_batch(&self, limit: usize) -> Result<Vec<Task>> {
        self.status_batch(TaskStatus::Pending, limit).await
    }

    pub async fn approved_batch(&self, limit: usize) -> Result<Vec<Task>> {
        self.status_batch(TaskStatus::Approved, limit).await
    }

    async fn status_batch(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>> {
        let status = status.as_str();
        let limit = limit as i64;
        self.query_tasks(
            "SELECT id FROM tasks WHERE status = ?1
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?2",
            move |stmt| collect_ids(stmt.query(rusqlite::params![status, limit])?),
        )
        .await
    }

    /// `InProgress` tasks whose execution started more than `threshold` ago.
    pub async fn stuck_tasks(&self, threshold: Duration) -> Result<Vec<Task>> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| StoreError::Validation(format!("stuck threshold: {e}")))?;
        let cutoff = ts(&(Utc::now() - threshold));
        self.query_tasks(
            "SELECT id FROM tasks
             WHERE status = 'in_progress' AND started_at IS NOT NULL AND started_at < ?1
             ORDER BY started_at ASC, id ASC",
            move |stmt| collect_ids(stmt.query(rusqlite::params![cutoff])?),
        )
        .await
    }

    /// Tasks with current-level output awaiting a (re-)test.
    pub async fn ready_for_testing(&self, limit: usize) -> Result<Vec<Task>> {
        let max = self.limits.max_test_attempts as i64;
        let limit = limit as i64;
        self.query_tasks(
            "SELECT t.id FROM tasks t
             JOIN task_levels l ON l.task_id = t.id AND l.level = t.current_level
             WHERE t.status IN ('testing', 'failed')
               AND l.test_count < ?1
               AND l.output IS NOT NULL AND TRIM(l.output) != ''
               AND t.merge_conflicts IS NULL
             ORDER BY t.started_at ASC, t.id ASC
             LIMIT ?2",
            move |stmt| collect_ids(stmt.query(rusqlite::params![max, limit])?),
        )
        .await
    }

    /// Failed tasks with nothing to test: planning or execution failures.
    pub async fn failed_without_output(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            "SELECT t.id FROM tasks t
             JOIN task_levels l ON l.task_id = t.id AND l.level = t.current_level
             WHERE t.status = 'failed'
               AND (l.output IS NULL OR TRIM(l.output) = '')
               AND t.merge_conflicts IS NULL
             ORDER BY t.priority DESC, t.id ASC",
            |stmt| collect_ids(stmt.query([])?),
        )
        .await
    }

    async fn query_tasks<F>(&self, sql: &'static str, ids: F) -> Result<Vec<Task>>
    where
        F: FnOnce(&mut rusqlite::Statement<'_>) -> rusqlite::Result<Vec<i64>> + Send + 'static,
    {
        Ok(self
            .conn
            .call(move |conn| {
                let ids = {
                    let mut stmt = conn.prepare(sql)?;
                    ids(&mut stmt)?
                };
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(task) = load_task(conn, id)? {
                        out.push(task);
                    }
                }
                Ok(out)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load, apply `f`, write back; all inside one transaction.
    async fn transition<F>(&self, id: i64, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> std::result::Result<(), TransitionError> + Send + 'static,
    {
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut task) = load_task(&tx, id)? else {
                    return Ok(Err(StoreError::NotFound(id)));
                };
                if let Err(e) = f(&mut task) {
                    return Ok(Err(StoreError::from(e)));
                }
                write_task(&tx, &task)?;
                tx.commit()?;
                Ok(Ok(task))
            })
            .await?;

        if let Ok(task) = &outcome {
            debug!(task_id = id, status = %task.status, level = %task.current_level, "task updated");
        }
        outcome
    }

    pub async fn mark_planning(&self, id: i64) -> Result<Task> {
        self.transition(id, |t| t.mark_planning()).await
    }

    pub async fn save_plan(&self, id: i64, plan: &str, auto_approve: bool) -> Result<Task> {
        let plan = plan.to_string();
        self.transition(id, move |t| t.save_plan(&plan, auto_approve)).await
    }

    pub async fn approve(&self, id: i64) -> Result<Task> {
        self.transition(id, |t| t.approve()).await
    }

    pub async fn request_feedback(&self, id: i64, feedback: &str) -> Result<Task> {
        let feedback = feedback.to_string();
        self.transition(id, move |t| t.request_feedback(&feedback)).await
    }

    pub async fn mark_in_progress(&self, id: i64) -> Result<Task> {
        self.transition(id, |t| t.mark_in_progress(now())).await
    }

    pub async fn mark_testing(&self, id: i64, output: &str) -> Result<Task> {
        let output = output.to_string();
        self.transition(id, move |t| t.mark_testing(&output, now()))
            .await
    }

    pub async fn mark_test_passed(&self, id: i64, level: Level, output: &str) -> Result<Task> {
        let output = output.to_string();
        let task = self
            .transition(id, move |t| t.mark_test_passed(level, &output, now()))
            .await?;
        info!(task_id = id, level = %level, status = %task.status, "level test passed");
        Ok(task)
    }

    /// Returns the updated task; its status is `Failed` or `Cancelled`.
    pub async fn mark_test_failed(&self, id: i64, level: Level, output: &str) -> Result<Task> {
        let output = output.to_string();
        let max = self.limits.max_test_attempts;
        let task = self
            .transition(id, move |t| t.mark_test_failed(level, &output, max).map(|_| ()))
            .await?;
        info!(
            task_id = id,
            level = %level,
            attempts = task.level(level).test_count,
            status = %task.status,
            "level test failed"
        );
        Ok(task)
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<Task> {
        let error = error.to_string();
        self.transition(id, move |t| t.mark_failed(&error)).await
    }

    pub async fn mark_merge_failed(
        &self,
        id: i64,
        conflicts: Vec<String>,
        message: &str,
    ) -> Result<Task> {
        let message = message.to_string();
        self.transition(id, move |t| t.mark_merge_failed(conflicts, &message))
            .await
    }

    pub async fn retry(&self, id: i64) -> Result<Task> {
        let max = self.limits.max_retries;
        self.transition(id, move |t| t.retry(max).map(|_| ())).await
    }

    pub async fn reenable(&self, id: i64, feedback: Option<&str>) -> Result<Task> {
        let feedback = feedback.map(str::to_string);
        let task = self
            .transition(id, move |t| t.reenable(feedback.as_deref()))
            .await?;
        info!(task_id = id, level = %task.current_level, "task re-enabled");
        Ok(task)
    }

    /// Record the worktree currently checked out for a task.
    pub async fn set_worktree(&self, id: i64, path: &str, branch: &str) -> Result<()> {
        let path = path.to_string();
        let branch = branch.to_string();
        self.update_row(id, move |conn| {
            conn.execute(
                "UPDATE tasks SET worktree_path = ?2, branch = ?3 WHERE id = ?1",
                rusqlite::params![id, path, branch],
            )
        })
        .await
    }

    /// Forget the worktree path. With `drop_branch` the branch name goes too.
    pub async fn clear_worktree(&self, id: i64, drop_branch: bool) -> Result<()> {
        self.update_row(id, move |conn| {
            conn.execute(
                "UPDATE tasks SET worktree_path = NULL,
                    branch = CASE WHEN ?2 THEN NULL ELSE branch END
                 WHERE id = ?1",
                rusqlite::params![id, drop_branch],
            )
        })
        .await
    }

    async fn update_row<F>(&self, id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<usize> + Send + 'static,
    {
        let changed = self.conn.call(move |conn| Ok(f(conn)?)).await?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Aggregates
    // -----------------------------------------------------------------------

    pub async fn stats(&self) -> Result<TaskStats> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
                let mut rows = stmt.query([])?;
                let mut stats = TaskStats::default();
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    let n: u64 = row.get(1)?;
                    if let Some(status) = TaskStatus::parse(&raw) {
                        stats.add(status, n);
                    }
                }
                Ok(stats)
            })
            .await?)
    }

    pub async fn level_stats(&self, level: Level) -> Result<LevelStats> {
        let n = level.number() as i64;
        Ok(self
            .conn
            .call(move |conn| {
                let passed: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM task_levels WHERE level = ?1 AND status = 'completed'",
                    rusqlite::params![n],
                    |r| r.get(0),
                )?;
                let in_progress: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE current_level = ?1
                       AND status NOT IN ('pending', 'completed', 'cancelled')",
                    rusqlite::params![n],
                    |r| r.get(0),
                )?;
                let pending: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE current_level = ?1 AND status = 'pending'",
                    rusqlite::params![n],
                    |r| r.get(0),
                )?;
                Ok(LevelStats {
                    level,
                    passed,
                    in_progress,
                    pending,
                })
            })
            .await?)
    }

    /// Mean execution time in seconds of each level, over levels whose test
    /// passed. Levels nobody has completed are absent.
    pub async fn average_durations(&self) -> Result<BTreeMap<Level, f64>> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT level, AVG(duration_secs) FROM task_levels
                     WHERE status = 'completed' AND duration_secs IS NOT NULL
                     GROUP BY level",
                )?;
                let mut rows = stmt.query([])?;
                let mut averages = BTreeMap::new();
                while let Some(row) = rows.next()? {
                    let n: i64 = row.get(0)?;
                    let avg: f64 = row.get(1)?;
                    if let Some(level) = Level::from_number(n) {
                        averages.insert(level, avg);
                    }
                }
                Ok(averages)
            })
            .await?)
    }

    /// Remaining-time estimates for every `InProgress` or `Testing` task,
    /// measured at `now`.
    pub async fn time_estimates(&self, now: DateTime<Utc>) -> Result<Vec<TimeEstimate>> {
        let averages = self.average_durations().await?;
        let mut active = self.list(Some(TaskStatus::InProgress)).await?;
        active.extend(self.list(Some(TaskStatus::Testing)).await?);
        Ok(active
            .iter()
            .filter_map(|task| {
                let avg = averages.get(&task.current_level).copied();
                TimeEstimate::for_task(task, avg, now)
            })
            .collect())
    }

    pub async fn all_level_stats(&self) -> Result<Vec<LevelStats>> {
        let mut out = Vec::with_capacity(Level::ALL.len());
        for level in Level::ALL {
            out.push(self.level_stats(level).await?);
        }
        Ok(out)
    }

    /// Passes at the previous level versus the threshold that unlocks `level`.
    /// MVP is always unlocked.
    pub async fn unlock_progress(&self, level: Level) -> Result<UnlockProgress> {
        let (prev, threshold) = match level {
            Level::Mvp => {
                return Ok(UnlockProgress {
                    level,
                    completed: 0,
                    threshold: 0,
                })
            }
            Level::Enhanced => (Level::Mvp, self.limits.unlock_enhanced),
            Level::Advanced => (Level::Enhanced, self.limits.unlock_advanced),
        };
        let completed = self.level_stats(prev).await?.passed;
        Ok(UnlockProgress {
            level,
            completed,
            threshold,
        })
    }

    pub async fn is_level_unlocked(&self, level: Level) -> Result<bool> {
        Ok(self.unlock_progress(level).await?.is_unlocked())
    }

    /// Record a one-time unlock event. Returns `false` when the level was
    /// already recorded.
    pub async fn record_unlock_event(&self, level: Level, tasks_completed: u64) -> Result<bool> {
        let n = level.number() as i64;
        let now = ts(&Utc::now());
        let inserted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO unlock_events (level, unlocked_at, tasks_completed)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![n, now, tasks_completed as i64],
                )?)
            })
            .await?;
        if inserted > 0 {
            info!(level = %level, tasks_completed, "level unlocked");
        }
        Ok(inserted > 0)
    }

    /// Record events for every level that crossed its threshold since the
    /// last check. Returns the newly unlocked levels.
    pub async fn check_unlocks(&self) -> Result<Vec<Level>> {
        let mut unlocked = Vec::new();
        for level in [Level::Enhanced, Level::Advanced] {
            let progress = self.unlock_progress(level).await?;
            if progress.is_unlocked() && self.record_unlock_event(level, progress.completed).await? {
                unlocked.push(level);
            }
        }
        Ok(unlocked)
    }

    pub async fn unlock_events(&self) -> Result<Vec<UnlockEvent>> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT level, unlocked_at, tasks_completed FROM unlock_events ORDER BY level",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let n: i64 = row.get(0)?;
                    let raw: String = row.get(1)?;
                    let completed: i64 = row.get(2)?;
                    out.push(UnlockEvent {
                        level: parse_level(0, n)?,
                        unlocked_at: parse_ts(1, &raw)?,
                        tasks_completed: completed.max(0) as u64,
                    });
                }
                Ok(out)
            })
            .await?)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

/// Current time at the precision timestamps are stored with.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_level(idx: usize, n: i64) -> rusqlite::Result<Level> {
    Level::from_number(n).ok_or_else(|| conversion_error(idx, format!("bad level {n}")))
}

fn collect_ids(mut rows: rusqlite::Rows<'_>) -> rusqlite::Result<Vec<i64>> {
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get(0)?);
    }
    Ok(ids)
}

fn load_task(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Task>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, description, category, priority, source, status,
                current_level, worktree_path, branch, original_plan_id,
                merge_conflicts, feedback, created_at, started_at, completed_at,
                error, retry_count
         FROM tasks WHERE id = ?1",
    )?;
    let mut rows = stmt.query(rusqlite::params![id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let status_raw: String = row.get(6)?;
    let level_n: i64 = row.get(7)?;
    let conflicts_raw: Option<String> = row.get(11)?;
    let created_raw: String = row.get(13)?;
    let retry_count: i64 = row.get(17)?;

    let merge_conflicts = conflicts_raw
        .map(|s| serde_json::from_str::<Vec<String>>(&s))
        .transpose()
        .map_err(|e| conversion_error(11, format!("bad conflict list: {e}")))?;

    let mut task = Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        priority: row.get(4)?,
        source: row.get(5)?,
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| conversion_error(6, format!("bad status {status_raw:?}")))?,
        current_level: parse_level(7, level_n)?,
        levels: Default::default(),
        worktree_path: row.get(8)?,
        branch: row.get(9)?,
        original_plan_id: row.get(10)?,
        merge_conflicts,
        feedback: row.get(12)?,
        created_at: parse_ts(13, &created_raw)?,
        started_at: parse_opt_ts(14, row.get(14)?)?,
        completed_at: parse_opt_ts(15, row.get(15)?)?,
        error: row.get(16)?,
        retry_count: retry_count.max(0) as u32,
    };

    let mut stmt = conn.prepare(
        "SELECT level, status, plan, output, test_output, test_count, completed_at, duration_secs
         FROM task_levels WHERE task_id = ?1",
    )?;
    let mut rows = stmt.query(rusqlite::params![id])?;
    while let Some(row) = rows.next()? {
        let level = parse_level(0, row.get(0)?)?;
        let status_raw: String = row.get(1)?;
        let test_count: i64 = row.get(5)?;
        *task.level_mut(level) = LevelState {
            status: LevelStatus::parse(&status_raw)
                .ok_or_else(|| conversion_error(1, format!("bad level status {status_raw:?}")))?,
            plan: row.get(2)?,
            output: row.get(3)?,
            test_output: row.get(4)?,
            test_count: test_count.max(0) as u32,
            completed_at: parse_opt_ts(6, row.get(6)?)?,
            duration_secs: row.get(7)?,
        };
    }
    Ok(Some(task))
}

fn write_task(conn: &rusqlite::Connection, task: &Task) -> rusqlite::Result<()> {
    let conflicts = task
        .merge_conflicts
        .as_ref()
        .map(|c| serde_json::to_string(c))
        .transpose()
        .map_err(|e| conversion_error(11, format!("conflict list: {e}")))?;
    conn.execute(
        "UPDATE tasks SET
            status = ?2, current_level = ?3, worktree_path = ?4, branch = ?5,
            merge_conflicts = ?6, feedback = ?7, started_at = ?8, completed_at = ?9,
            error = ?10, retry_count = ?11
         WHERE id = ?1",
        rusqlite::params![
            task.id,
            task.status.as_str(),
            task.current_level.number() as i64,
            task.worktree_path,
            task.branch,
            conflicts,
            task.feedback,
            task.started_at.as_ref().map(ts),
            task.completed_at.as_ref().map(ts),
            task.error,
            task.retry_count as i64,
        ],
    )?;
    write_levels(conn, task)
}

fn write_levels(conn: &rusqlite::Connection, task: &Task) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO task_levels (task_id, level, status, plan, output, test_output,
            test_count, completed_at, duration_secs)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(task_id, level) DO UPDATE SET
            status = excluded.status, plan = excluded.plan, output = excluded.output,
            test_output = excluded.test_output, test_count = excluded.test_count,
            completed_at = excluded.completed_at, duration_secs = excluded.duration_secs",
    )?;
    for level in Level::ALL {
        let state = task.level(level);
        stmt.execute(rusqlite::params![
            task.id,
            level.number() as i64,
            state.status.as_str(),
            state.plan,
            state.output,
            state.test_output,
            state.test_count as i64,
            state.completed_at.as_ref().map(ts),
            state.duration_secs,
        ])?;
    }
    Ok(())
}
