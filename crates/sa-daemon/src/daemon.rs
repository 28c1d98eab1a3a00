use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sa_core::agent::AgentRunner;
use sa_core::config::Config;
use sa_core::git::GitRunner;
use sa_core::lockfile::{LockGuard, ProcessLock};
use sa_harness::shutdown::ShutdownSignal;
use tracing::{error, info, warn};

use crate::orchestrator::Orchestrator;

/// How long the monitor gets to wind down after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Long-running runner: holds the repository lock for its lifetime and runs
/// an orchestration cycle every `general.cycle_interval_secs` while the
/// self-healing monitor watches the logs.
pub struct Daemon {
    repo: PathBuf,
    orchestrator: Orchestrator,
    shutdown: ShutdownSignal,
    interval: Duration,
    _lock: LockGuard,
}

impl Daemon {
    pub async fn start(
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
        let lock = ProcessLock::new(layout.lock_path())
            .acquire_or_fail()
            .context("failed to acquire runner lock")?;

        let interval = Duration::from_secs(config.general.cycle_interval_secs.max(1));
        let orchestrator = Orchestrator::open(repo, config, git, agent, shutdown.clone()).await?;
        Ok(Self {
            repo: repo.to_path_buf(),
            orchestrator,
            shutdown,
            interval,
            _lock: lock,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Cycle until shutdown. A failed cycle is logged and retried on the
    /// next tick.
    pub async fn run(mut self) -> Result<()> {
        info!(
            repo = %self.repo.display(),
            interval_secs = self.interval.as_secs(),
            "daemon started"
        );
        let monitor = self.orchestrator.spawn_monitor(&self.shutdown).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            match self.orchestrator.run_cycle().await {
                Ok(report) => match serde_json::to_string(&report) {
                    Ok(json) => info!(report = %json, "cycle report"),
                    Err(_) => info!(?report, "cycle report"),
                },
                Err(e) => error!(error = %format!("{e:#}"), "cycle failed"),
            }

            ticker.reset();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        info!("daemon shutting down");
        if let Some(handle) = monitor {
            let expected = 1;
            let drained = self.shutdown.wait_for_drain(expected, DRAIN_TIMEOUT).await;
            if !drained.is_complete() {
                warn!("self-healing monitor did not stop in time");
                handle.abort();
            }
        }
        info!("daemon stopped");
        Ok(())
    }
}
