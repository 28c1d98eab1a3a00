use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sa_agents::{CliAgentRunner, PromptRegistry};
use sa_core::discovery::DiscoveryCategory;
use sa_daemon::discovery::{Discoverer, DiscoveryReport};
use tracing::info;

use super::{load_config, open_store};

/// Run the `discover` subcommand. No categories means all of them.
pub async fn run(
    repo: &Path,
    categories: &[String],
    timeout_secs: u64,
    dry_run: bool,
) -> anyhow::Result<()> {
    let categories = parse_categories(categories)?;
    let config = load_config(repo)?;
    let layout = config.layout(repo);

    let mut prompts = PromptRegistry::new();
    prompts.load_overrides(&layout.root().join("prompts"));
    let agent = Arc::new(CliAgentRunner::new(config.agent.command.clone()));
    let discoverer = Discoverer::new(repo, agent, prompts).with_timeout(Duration::from_secs(timeout_secs));

    info!(repo = %repo.display(), categories = categories.len(), dry_run, "running discovery");
    let report = if dry_run {
        discoverer.run(&categories, None).await?
    } else {
        let store = open_store(repo).await?;
        discoverer.run(&categories, Some(&store)).await?
    };

    print!("{}", render(&report, dry_run)?);
    Ok(())
}

fn parse_categories(raw: &[String]) -> anyhow::Result<Vec<DiscoveryCategory>> {
    if raw.is_empty() {
        return Ok(DiscoveryCategory::ALL.to_vec());
    }
    raw.iter()
        .map(|name| {
            DiscoveryCategory::parse(name).with_context(|| {
                let known: Vec<&str> = DiscoveryCategory::ALL.iter().map(|c| c.as_str()).collect();
                format!("unknown category '{name}' (expected one of: {})", known.join(", "))
            })
        })
        .collect()
}

fn render(report: &DiscoveryReport, dry_run: bool) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "Reviewed {} categories, {} findings ({} unique)",
        report.categories.len(),
        report.found,
        report.findings.len()
    )?;
    for category in &report.failed {
        writeln!(out, "  {category}: agent run failed")?;
    }
    for finding in &report.findings {
        writeln!(
            out,
            "  [{:>3}] {:<14}{}",
            finding.priority,
            finding.category.as_str(),
            finding.title
        )?;
    }
    if dry_run {
        writeln!(out, "Dry run: nothing was added.")?;
    } else {
        writeln!(
            out,
            "Added {} tasks, skipped {} already queued.",
            report.added.len(),
            report.skipped.len()
        )?;
    }
    Ok(out)
}
