pub mod agent;
pub mod config;
pub mod discovery;
pub mod file_watcher;
pub mod git;
pub mod layout;
pub mod lockfile;
pub mod plan;
pub mod store;
pub mod test_env;
pub mod types;
pub mod verdict;
pub mod worktree_manager;
