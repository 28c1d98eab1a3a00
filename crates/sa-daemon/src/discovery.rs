//! Backlog discovery: ask the agent for improvements per category and file
//! the new ones as pending tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sa_agents::PromptRegistry;
use sa_core::agent::{AgentRequest, AgentRunner};
use sa_core::discovery::{self, DiscoveryCategory, Finding};
use sa_core::store::TaskStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::orchestrator::PLAN_TOOLS;

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub categories: Vec<DiscoveryCategory>,
    /// Categories whose agent run failed or timed out.
    pub failed: Vec<DiscoveryCategory>,
    /// Findings reported, before deduplication.
    pub found: usize,
    /// Prioritized, deduplicated findings.
    pub findings: Vec<Finding>,
    pub added: Vec<i64>,
    pub skipped: Vec<String>,
}

/// Runs read-only review passes against one repository.
pub struct Discoverer {
    repo: PathBuf,
    agent: Arc<dyn AgentRunner>,
    prompts: Arc<PromptRegistry>,
    timeout: Duration,
}

impl Discoverer {
    pub fn new(repo: &Path, agent: Arc<dyn AgentRunner>, prompts: PromptRegistry) -> Self {
        Self {
            repo: repo.to_path_buf(),
            agent,
            prompts: Arc::new(prompts),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Findings for one category. `None` when the agent run fails; an
    /// answer without a findings array is `Some(vec![])`.
    pub async fn discover(&self, category: DiscoveryCategory) -> Option<Vec<Finding>> {
        let request = AgentRequest::new(
            self.prompts.discover(category, &self.repo),
            &self.repo,
            self.timeout,
        )
        .with_tools(PLAN_TOOLS);

        match self.agent.run(request).await {
            Ok(output) if output.success => {
                let findings = discovery::parse_findings(&output.stdout, category);
                info!(category = %category, count = findings.len(), "discovery pass finished");
                Some(findings)
            }
            Ok(output) => {
                warn!(category = %category, reason = %output.failure_reason(), "discovery pass failed");
                None
            }
            Err(e) => {
                warn!(category = %category, error = %e, "discovery pass failed");
                None
            }
        }
    }

    /// Review every category in turn, then prioritize. With a store the
    /// survivors are filed; titles already queued are reported as skipped.
    pub async fn run(
        &self,
        categories: &[DiscoveryCategory],
        store: Option<&TaskStore>,
    ) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport {
            categories: categories.to_vec(),
            ..Default::default()
        };

        let mut all = Vec::new();
        for &category in categories {
            match self.discover(category).await {
                Some(findings) => all.extend(findings),
                None => report.failed.push(category),
            }
        }
        report.found = all.len();
        report.findings = discovery::prioritize(all);

        if let Some(store) = store {
            let intake = discovery::intake(store, &report.findings).await?;
            report.added = intake.added.iter().map(|t| t.id).collect();
            report.skipped = intake.skipped;
        }
        Ok(report)
    }
}
