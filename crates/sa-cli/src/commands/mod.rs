pub mod discover;
pub mod monitor;
pub mod run;
pub mod status;
pub mod tasks;

use std::path::{Path, PathBuf};

use anyhow::Context;
use sa_core::config::Config;
use sa_core::store::TaskStore;
use sa_daemon::orchestrator::store_limits;

/// `--repo` if given, the current directory otherwise; always canonical.
pub fn resolve_repo(repo: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let repo = match repo {
        Some(path) => path,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    repo.canonicalize()
        .with_context(|| format!("repository not found: {}", repo.display()))
}

pub fn load_config(repo: &Path) -> anyhow::Result<Config> {
    Config::load_for(repo).context("failed to load config")
}

/// Open the repository's task store with the configured limits.
pub async fn open_store(repo: &Path) -> anyhow::Result<TaskStore> {
    let config = load_config(repo)?;
    let layout = config.layout(repo);
    layout
        .ensure()
        .with_context(|| format!("failed to create {}", layout.root().display()))?;
    let db = layout.db_path();
    Ok(TaskStore::open(&db)
        .await
        .with_context(|| format!("failed to open task store {}", db.display()))?
        .with_limits(store_limits(&config)))
}
