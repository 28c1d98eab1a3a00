use std::cmp::Ordering;
use std::sync::Arc;

use sa_core::types::Task;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Default number of concurrent workers when none is specified.
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Orders ready tasks and bounds how many execute at once.
///
/// Priority rules (highest to lowest):
/// 1. Higher `priority` field wins.
/// 2. Ties broken by `created_at` (oldest first), then by id.
///
/// Enforces a concurrency limit via a [`Semaphore`]. Callers acquire a
/// permit from [`concurrency_gate`](Self::concurrency_gate) before starting
/// a task and drop it when the task reaches `testing` or `failed`.
pub struct TaskScheduler {
    concurrency_gate: Arc<Semaphore>,
    max_workers: usize,
}

impl TaskScheduler {
    pub fn new(max_workers: usize) -> Self {
        let limit = if max_workers == 0 {
            warn!("max_workers was 0, defaulting to {DEFAULT_MAX_WORKERS}");
            DEFAULT_MAX_WORKERS
        } else {
            max_workers
        };
        Self {
            concurrency_gate: Arc::new(Semaphore::new(limit)),
            max_workers: limit,
        }
    }

    /// Returns a clone of the concurrency semaphore.
    ///
    /// Hold the `OwnedSemaphorePermit` from `acquire_owned()` for the whole
    /// execution of one task.
    pub fn concurrency_gate(&self) -> Arc<Semaphore> {
        Arc::clone(&self.concurrency_gate)
    }

    /// Number of worker slots currently free.
    pub fn available_slots(&self) -> usize {
        self.concurrency_gate.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Sort a batch into dispatch order.
    pub fn prioritize(&self, tasks: &mut [Task]) {
        tasks.sort_by(dispatch_order);
        if let Some(first) = tasks.first() {
            debug!(
                task_id = first.id,
                priority = first.priority,
                batch = tasks.len(),
                "batch prioritized"
            );
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

fn dispatch_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
