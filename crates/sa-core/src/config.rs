use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::layout::DataLayout;

/// Runner configuration, loaded from `<repo>/.selfai_data/config.toml` or
/// `~/.selfai/config.toml`. Every section is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub levels: LevelsConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub test_env: TestEnvConfig,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Config {
    /// Resolve config for a repository: the repo-local file first, then the
    /// user file, else defaults.
    pub fn load_for(repo: &Path) -> Result<Self, ConfigError> {
        let local = DataLayout::new(repo).config_path();
        if local.exists() {
            return Self::load_from(local);
        }
        let user = Self::user_path();
        if user.exists() {
            return Self::load_from(user);
        }
        let cfg = Config::default();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.data_dir.trim().is_empty() {
            return Err(ConfigError::Validation("general.data_dir must not be empty".into()));
        }
        if self.general.cycle_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "general.cycle_interval_secs must be positive".into(),
            ));
        }
        self.orchestrator.validate()?;
        self.test_env.validate()?;
        self.healing.validate()?;
        if self.worktree.main_branch.trim().is_empty() {
            return Err(ConfigError::Validation("worktree.main_branch must not be empty".into()));
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::Validation("agent.command must not be empty".into()));
        }
        Ok(())
    }

    /// Data layout for `repo` honouring `general.data_dir`.
    pub fn layout(&self, repo: &Path) -> DataLayout {
        DataLayout::with_dir_name(repo, &self.general.data_dir)
    }

    fn user_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".selfai")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            cycle_interval_secs: default_cycle_interval(),
        }
    }
}

fn default_data_dir() -> String {
    DataLayout::DIR_NAME.into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_cycle_interval() -> u64 {
    180
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_test_attempts")]
    pub max_test_attempts: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,
    #[serde(default = "default_true")]
    pub auto_approve_plans: bool,
    #[serde(default = "default_max_plans")]
    pub max_plans_per_cycle: usize,
    #[serde(default = "default_plan_timeout")]
    pub plan_timeout_secs: u64,
    #[serde(default = "default_execute_timeout")]
    pub execute_timeout_secs: u64,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_test_attempts: default_max_test_attempts(),
            max_retries: default_max_retries(),
            stuck_after_secs: default_stuck_after(),
            auto_approve_plans: true,
            max_plans_per_cycle: default_max_plans(),
            plan_timeout_secs: default_plan_timeout(),
            execute_timeout_secs: default_execute_timeout(),
            test_timeout_secs: default_test_timeout(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Validation("orchestrator.max_workers must be at least 1".into()));
        }
        if self.max_test_attempts == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.max_test_attempts must be at least 1".into(),
            ));
        }
        for (name, secs) in [
            ("plan_timeout_secs", self.plan_timeout_secs),
            ("execute_timeout_secs", self.execute_timeout_secs),
            ("test_timeout_secs", self.test_timeout_secs),
            ("stuck_after_secs", self.stuck_after_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "orchestrator.{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn default_max_workers() -> usize {
    3
}
fn default_max_test_attempts() -> u32 {
    crate::types::MAX_TEST_ATTEMPTS
}
fn default_max_retries() -> u32 {
    5
}
fn default_stuck_after() -> u64 {
    900
}
fn default_true() -> bool {
    true
}
fn default_max_plans() -> usize {
    3
}
fn default_plan_timeout() -> u64 {
    180
}
fn default_execute_timeout() -> u64 {
    900
}
fn default_test_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelsConfig {
    #[serde(default = "default_level2_threshold")]
    pub level2_unlock_threshold: u64,
    #[serde(default = "default_level3_threshold")]
    pub level3_unlock_threshold: u64,
}

impl Default for LevelsConfig {
    fn default() -> Self {
        Self {
            level2_unlock_threshold: default_level2_threshold(),
            level3_unlock_threshold: default_level3_threshold(),
        }
    }
}

fn default_level2_threshold() -> u64 {
    5
}
fn default_level3_threshold() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorktreeConfig {
    #[serde(default = "default_min_free_disk")]
    pub min_free_disk_mb: u64,
    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,
    #[serde(default = "default_git_attempts")]
    pub git_max_attempts: u32,
    #[serde(default = "default_git_retry_delay")]
    pub git_retry_base_delay_ms: u64,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_conflict_timeout")]
    pub conflict_timeout_secs: u64,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            min_free_disk_mb: default_min_free_disk(),
            git_timeout_secs: default_git_timeout(),
            git_max_attempts: default_git_attempts(),
            git_retry_base_delay_ms: default_git_retry_delay(),
            main_branch: default_main_branch(),
            conflict_timeout_secs: default_conflict_timeout(),
        }
    }
}

fn default_min_free_disk() -> u64 {
    500
}
fn default_git_timeout() -> u64 {
    30
}
fn default_git_attempts() -> u32 {
    3
}
fn default_git_retry_delay() -> u64 {
    2000
}
fn default_main_branch() -> String {
    "main".into()
}
fn default_conflict_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestEnvConfig {
    #[serde(default = "default_max_environments")]
    pub max_environments: usize,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_port_range_size")]
    pub port_range_size: u16,
}

impl Default for TestEnvConfig {
    fn default() -> Self {
        Self {
            max_environments: default_max_environments(),
            port_base: default_port_base(),
            port_range_size: default_port_range_size(),
        }
    }
}

impl TestEnvConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_environments == 0 {
            return Err(ConfigError::Validation(
                "test_env.max_environments must be at least 1".into(),
            ));
        }
        if self.port_range_size < 5 {
            return Err(ConfigError::Validation(
                "test_env.port_range_size must cover the 5 service offsets".into(),
            ));
        }
        if self.port_base < 1024 || self.port_base as u32 + self.port_range_size as u32 > u16::MAX as u32 {
            return Err(ConfigError::Validation(format!(
                "test_env.port_base {} is out of range",
                self.port_base
            )));
        }
        Ok(())
    }
}

fn default_max_environments() -> usize {
    crate::test_env::DEFAULT_MAX_ENVIRONMENTS
}
fn default_port_base() -> u16 {
    crate::test_env::PORT_BASE
}
fn default_port_range_size() -> u16 {
    crate::test_env::PORT_RANGE_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_heal: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_records")]
    pub max_records_per_type: u32,
    #[serde(default = "default_stale_artifact")]
    pub stale_artifact_secs: u64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_heal: true,
            min_confidence: default_min_confidence(),
            cooldown_secs: default_cooldown(),
            health_check_interval_secs: default_health_interval(),
            retention_days: default_retention_days(),
            max_records_per_type: default_max_records(),
            stale_artifact_secs: default_stale_artifact(),
        }
    }
}

impl HealingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Validation(format!(
                "healing.min_confidence must be within 0..=1, got {}",
                self.min_confidence
            )));
        }
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "healing.health_check_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_min_confidence() -> f64 {
    0.6
}
fn default_cooldown() -> u64 {
    60
}
fn default_health_interval() -> u64 {
    60
}
fn default_retention_days() -> u32 {
    30
}
fn default_max_records() -> u32 {
    1000
}
fn default_stale_artifact() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_execute_tools")]
    pub execute_tools: Vec<String>,
    #[serde(default = "default_conflict_tools")]
    pub conflict_tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            execute_tools: default_execute_tools(),
            conflict_tools: default_conflict_tools(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".into()
}
fn default_execute_tools() -> Vec<String> {
    ["Edit", "Write", "Bash", "Glob", "Grep", "Read"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_conflict_tools() -> Vec<String> {
    ["Read", "Edit", "Bash"].into_iter().map(String::from).collect()
}
