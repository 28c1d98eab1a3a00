use std::path::{Path, PathBuf};

/// Where the runner keeps its state inside a target repository.
///
/// ```text
/// <repo>/.selfai_data/
///   config.toml
///   runner.lock
///   healing.db
///   data/improvements.db
///   logs/
///   worktrees/task-<id>/
///   test_databases/<env>/test.db
///   test_worktrees/<env>/
///   test_logs/<env>/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    repo: PathBuf,
    root: PathBuf,
}

impl DataLayout {
    pub const DIR_NAME: &'static str = ".selfai_data";

    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self::with_dir_name(repo, Self::DIR_NAME)
    }

    pub fn with_dir_name(repo: impl Into<PathBuf>, dir_name: &str) -> Self {
        let repo = repo.into();
        let root = repo.join(dir_name);
        Self { repo, root }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("data").join("improvements.db")
    }

    pub fn healing_db_path(&self) -> PathBuf {
        self.root.join("healing.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("runner.lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn test_databases_dir(&self) -> PathBuf {
        self.root.join("test_databases")
    }

    pub fn test_worktrees_dir(&self) -> PathBuf {
        self.root.join("test_worktrees")
    }

    pub fn test_logs_dir(&self) -> PathBuf {
        self.root.join("test_logs")
    }

    /// Create every directory the runner writes to.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.root.join("data"),
            self.logs_dir(),
            self.worktrees_dir(),
            self.test_databases_dir(),
            self.test_worktrees_dir(),
            self.test_logs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
