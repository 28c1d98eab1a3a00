use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use sa_agents::CliAgentRunner;
use sa_daemon::orchestrator::{git_runner, run_once};
use sa_harness::shutdown::ShutdownSignal;
use tracing::info;

use super::load_config;

/// Run the `run` subcommand: one locked orchestration cycle, report on stdout.
pub async fn run(repo: &Path) -> anyhow::Result<()> {
    let config = load_config(repo)?;
    let layout = config.layout(repo);
    layout
        .ensure()
        .with_context(|| format!("failed to create {}", layout.root().display()))?;
    let _log_guard =
        sa_telemetry::logging::init_logging_with_file("selfai", &config.general.log_level, &layout.logs_dir())
            .context("failed to initialise logging")?;

    let shutdown = ShutdownSignal::new();
    let _signals = shutdown.listen_for_os_signals();

    info!(repo = %repo.display(), "running one cycle");
    let git = git_runner(&config);
    let agent = Arc::new(CliAgentRunner::new(config.agent.command.clone()));
    let report = run_once(repo, config, git, agent, &shutdown).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
