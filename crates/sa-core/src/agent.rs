use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent timed out after {0}s")]
    Timeout(u64),
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    #[error("agent io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub allowed_tools: Vec<String>,
    pub work_dir: PathBuf,
    pub timeout: Duration,
    /// Extra environment on top of the inherited one.
    pub env: HashMap<String, String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, work_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            allowed_tools: Vec::new(),
            work_dir: work_dir.into(),
            timeout,
            env: HashMap::new(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Captured result of a finished agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl AgentOutput {
    /// Short failure reason for task error fields.
    pub fn failure_reason(&self) -> String {
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match self.exit_code {
            Some(code) => format!("agent exited with code {code}: {detail}"),
            None => format!("agent terminated by signal: {detail}"),
        }
    }
}

/// Seam between orchestration and the external coding agent.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutput, AgentError>;
}
