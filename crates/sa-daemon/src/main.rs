//! sa-daemon: runs orchestration cycles against one repository until
//! interrupted, with the self-healing monitor alongside.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sa_agents::CliAgentRunner;
use sa_core::config::Config;
use sa_daemon::daemon::Daemon;
use sa_daemon::orchestrator::git_runner;
use sa_harness::shutdown::ShutdownSignal;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let repo = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let repo = repo
        .canonicalize()
        .with_context(|| format!("repository not found: {}", repo.display()))?;

    let config = Config::load_for(&repo).context("failed to load config")?;
    let layout = config.layout(&repo);
    layout
        .ensure()
        .with_context(|| format!("failed to create {}", layout.root().display()))?;
    let _log_guard =
        sa_telemetry::logging::init_logging_with_file("sa-daemon", &config.general.log_level, &layout.logs_dir())
            .context("failed to initialise logging")?;

    info!(repo = %repo.display(), pid = std::process::id(), "sa-daemon starting");

    let shutdown = ShutdownSignal::new();
    let _signals = shutdown.listen_for_os_signals();

    let git = git_runner(&config);
    let agent = Arc::new(CliAgentRunner::new(config.agent.command.clone()));
    let daemon = Daemon::start(&repo, config, git, agent, shutdown).await?;
    daemon.run().await
}
