//! Isolated test environments.
//!
//! Each environment gets its own port range, SQLite file, git worktree and
//! log directory, so concurrent test runs never share mutable state.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::git::GitRunner;
use crate::layout::DataLayout;

pub const DEFAULT_MAX_ENVIRONMENTS: usize = 5;
pub const PORT_BASE: u16 = 10_000;
pub const PORT_RANGE_SIZE: u16 = 10;

#[derive(Debug, Error)]
pub enum TestEnvError {
    #[error("test environment capacity reached ({max} active)")]
    Capacity { max: usize },
    #[error("test environment already active for task #{0}")]
    Conflict(i64),
    #[error("no free port range for task #{0}")]
    Ports(i64),
    #[error("git command failed: {0}")]
    Git(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TestEnvError>;

/// Well-known offsets inside an environment's port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Main,
    Database,
    Cache,
    Api,
    Worker,
}

impl Service {
    pub fn offset(self) -> u16 {
        match self {
            Service::Main => 0,
            Service::Database => 1,
            Service::Cache => 2,
            Service::Api => 3,
            Service::Worker => 4,
        }
    }
}

// ---------------------------------------------------------------------------
// PortAllocator
// ---------------------------------------------------------------------------

/// Hands out disjoint port ranges, preferring `base + task_id * size`.
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
    base: u16,
    range_size: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PORT_BASE, PORT_RANGE_SIZE)
    }
}

impl PortAllocator {
    pub fn new(base: u16, range_size: u16) -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
            base,
            range_size: range_size.max(1),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn range_size(&self) -> u16 {
        self.range_size
    }

    fn slot_count(&self) -> u32 {
        (u16::MAX as u32).saturating_sub(self.base as u32) / self.range_size as u32
    }

    /// Reserve a range for `task_id` and return its base port. Candidate
    /// ranges are probed forward from the task's preferred slot, wrapping
    /// once around the usable space.
    pub fn allocate(&self, task_id: i64) -> Option<u16> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        let slots = self.slot_count();
        if slots == 0 {
            return None;
        }
        let first = (task_id.unsigned_abs() % slots as u64) as u32;
        for step in 0..slots {
            let slot = (first + step) % slots;
            let base = (self.base as u32 + slot * self.range_size as u32) as u16;
            let ports: Vec<u16> = (base..base + self.range_size).collect();
            if ports.iter().all(|p| !reserved.contains(p) && port_is_free(*p)) {
                reserved.extend(ports);
                debug!(task_id, base, "port range reserved");
                return Some(base);
            }
        }
        None
    }

    pub fn release(&self, base: u16) {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        for port in base..base.saturating_add(self.range_size) {
            reserved.remove(&port);
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

// ---------------------------------------------------------------------------
// TestEnvironment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEnvironment {
    pub env_id: String,
    pub task_id: i64,
    pub port_base: u16,
    pub db_path: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub log_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl TestEnvironment {
    pub fn port(&self, service: Service) -> u16 {
        self.port_base + service.offset()
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.log"))
    }

    /// Variables that describe this environment to a test process.
    pub fn env_vars(&self) -> HashMap<String, String> {
        HashMap::from([
            ("SELFAI_TEST_ENV_ID".to_string(), self.env_id.clone()),
            ("SELFAI_TEST_PORT_BASE".to_string(), self.port_base.to_string()),
            (
                "SELFAI_TEST_DB_PATH".to_string(),
                self.db_path.display().to_string(),
            ),
            (
                "SELFAI_TEST_LOG_DIR".to_string(),
                self.log_dir.display().to_string(),
            ),
            (
                "SELFAI_TEST_WORKTREE".to_string(),
                self.worktree_path.display().to_string(),
            ),
            ("SELFAI_ISOLATED_TEST".to_string(), "1".to_string()),
        ])
    }

    /// The host environment overlaid with [`env_vars`](Self::env_vars).
    pub fn as_subprocess_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(self.env_vars());
        env
    }
}

// ---------------------------------------------------------------------------
// TestEnvironmentManager
// ---------------------------------------------------------------------------

pub struct TestEnvironmentManager {
    repo: PathBuf,
    db_root: PathBuf,
    worktree_root: PathBuf,
    log_root: PathBuf,
    git: Arc<dyn GitRunner>,
    ports: PortAllocator,
    active: Mutex<HashMap<String, TestEnvironment>>,
    max_environments: usize,
}

impl TestEnvironmentManager {
    pub fn new(layout: &DataLayout, git: Arc<dyn GitRunner>, max_environments: usize) -> Self {
        Self {
            repo: layout.repo().to_path_buf(),
            db_root: layout.test_databases_dir(),
            worktree_root: layout.test_worktrees_dir(),
            log_root: layout.test_logs_dir(),
            git,
            ports: PortAllocator::default(),
            active: Mutex::new(HashMap::new()),
            max_environments: max_environments.max(1),
        }
    }

    pub fn max_environments(&self) -> usize {
        self.max_environments
    }

    pub fn active_count(&self) -> usize {
        self.active_map().len()
    }

    pub fn active_environments(&self) -> Vec<TestEnvironment> {
        let mut envs: Vec<TestEnvironment> = self.active_map().values().cloned().collect();
        envs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        envs
    }

    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    fn active_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, TestEnvironment>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provision an environment whose worktree is branched from `base_ref`.
    /// A task has at most one live environment.
    pub async fn create(&self, task_id: i64, base_ref: &str) -> Result<TestEnvironment> {
        let env = {
            let mut active = self.active_map();
            if active.values().any(|e| e.task_id == task_id) {
                return Err(TestEnvError::Conflict(task_id));
            }
            if active.len() >= self.max_environments {
                return Err(TestEnvError::Capacity {
                    max: self.max_environments,
                });
            }
            let port_base = self.ports.allocate(task_id).ok_or(TestEnvError::Ports(task_id))?;
            let short = Uuid::new_v4().simple().to_string();
            let env_id = format!("test-env-{task_id}-{}", &short[..8]);
            let env = TestEnvironment {
                task_id,
                port_base,
                db_path: self.db_root.join(&env_id).join("test.db"),
                worktree_path: self.worktree_root.join(&env_id),
                branch: format!("test/{env_id}"),
                log_dir: self.log_root.join(&env_id),
                created_at: Utc::now(),
                env_id,
            };
            active.insert(env.env_id.clone(), env.clone());
            env
        };

        if let Err(e) = self.provision(&env, base_ref).await {
            warn!(env_id = %env.env_id, error = %e, "test environment provisioning failed");
            self.forget(&env);
            self.remove_git_resources(&env).await;
            return Err(e);
        }

        info!(
            env_id = %env.env_id,
            task_id,
            port_base = env.port_base,
            base_ref,
            "test environment created"
        );
        Ok(env)
    }

    async fn provision(&self, env: &TestEnvironment, base_ref: &str) -> Result<()> {
        if let Some(parent) = env.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&env.db_path).await?;

        tokio::fs::create_dir_all(&env.log_dir).await?;
        for name in ["main", "test", "error"] {
            tokio::fs::File::create(env.log_file(name)).await?;
        }

        tokio::fs::create_dir_all(&self.worktree_root).await?;
        let path = env.worktree_path.to_string_lossy().to_string();
        let out = self
            .git
            .run_git(
                &self.repo,
                &["worktree", "add", "-b", &env.branch, &path, base_ref],
            )
            .await
            .map_err(TestEnvError::Git)?;
        if !out.success {
            return Err(TestEnvError::Git(out.message()));
        }
        Ok(())
    }

    /// Tear down an environment. Logs are kept. Returns `false` for an
    /// unknown or already released id.
    pub async fn release(&self, env_id: &str) -> bool {
        let env = self.active_map().get(env_id).cloned();
        let Some(env) = env else {
            return false;
        };
        self.forget(&env);
        self.remove_git_resources(&env).await;
        info!(env_id, "test environment released");
        true
    }

    /// Synchronous part of a release: slot, ports and database file.
    fn forget(&self, env: &TestEnvironment) {
        self.active_map().remove(&env.env_id);
        self.ports.release(env.port_base);
        remove_db(&env.db_path);
    }

    async fn remove_git_resources(&self, env: &TestEnvironment) {
        remove_git_resources(self.git.as_ref(), &self.repo, env).await;
    }

    /// Create an environment wrapped in a guard that releases it.
    pub async fn acquire(self: &Arc<Self>, task_id: i64, base_ref: &str) -> Result<EnvironmentGuard> {
        let env = self.create(task_id, base_ref).await?;
        Ok(EnvironmentGuard {
            manager: Arc::clone(self),
            env,
            released: false,
        })
    }

    /// Run `f` inside a fresh environment that is released afterwards,
    /// including when `f` panics or its future is dropped.
    pub async fn scoped<F, Fut, T>(self: &Arc<Self>, task_id: i64, base_ref: &str, f: F) -> Result<T>
    where
        F: FnOnce(TestEnvironment) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(task_id, base_ref).await?;
        let out = f(guard.env().clone()).await;
        guard.release().await;
        Ok(out)
    }
}

async fn remove_git_resources(git: &dyn GitRunner, repo: &Path, env: &TestEnvironment) {
    let path = env.worktree_path.to_string_lossy().to_string();
    if let Ok(out) = git
        .run_git(repo, &["worktree", "remove", "--force", &path])
        .await
    {
        if !out.success {
            debug!(env_id = %env.env_id, stderr = %out.stderr.trim(), "worktree remove failed");
        }
    }
    if env.worktree_path.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&env.worktree_path).await {
            warn!(env_id = %env.env_id, error = %e, "failed to remove test worktree");
        }
        let _ = git.run_git(repo, &["worktree", "prune"]).await;
    }
    let _ = git.run_git(repo, &["branch", "-D", &env.branch]).await;
}

fn remove_db(db_path: &Path) {
    match std::fs::remove_file(db_path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            warn!(path = %db_path.display(), error = %e, "failed to remove test database");
        }
        _ => {}
    }
    if let Some(parent) = db_path.parent() {
        // Only succeeds when empty.
        let _ = std::fs::remove_dir(parent);
    }
}

// ---------------------------------------------------------------------------
// EnvironmentGuard
// ---------------------------------------------------------------------------

/// Owns an environment until [`release`](Self::release) is awaited. If the
/// guard is dropped instead, slot, ports and database are freed immediately
/// and git cleanup is spawned on the current runtime.
pub struct EnvironmentGuard {
    manager: Arc<TestEnvironmentManager>,
    env: TestEnvironment,
    released: bool,
}

impl EnvironmentGuard {
    pub fn env(&self) -> &TestEnvironment {
        &self.env
    }

    pub async fn release(mut self) {
        self.released = true;
        self.manager.release(&self.env.env_id).await;
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!(env_id = %self.env.env_id, "test environment dropped without release");
        self.manager.forget(&self.env);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(&self.manager);
                let env = self.env.clone();
                handle.spawn(async move {
                    manager.remove_git_resources(&env).await;
                });
            }
            Err(_) => warn!(env_id = %self.env.env_id, "no runtime; test worktree left for pruning"),
        }
    }
}
