use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use sa_core::agent::{AgentError, AgentOutput, AgentRequest, AgentRunner};
use tracing::{debug, warn};

/// Runs the agent CLI as `<command> -p <prompt> --allowedTools <tools...>`
/// in the request's working directory.
///
/// The child is killed when the timeout elapses (the output future is
/// dropped with `kill_on_drop`).
#[derive(Debug, Clone)]
pub struct CliAgentRunner {
    command: String,
    extra_args: Vec<String>,
}

impl CliAgentRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            extra_args: Vec::new(),
        }
    }

    /// Arguments placed before `-p`, e.g. a model flag.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Full argument vector for a request.
    pub fn args_for(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.push("-p".to_string());
        args.push(request.prompt.clone());
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.extend(request.allowed_tools.iter().cloned());
        }
        args
    }
}

impl Default for CliAgentRunner {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let started = Instant::now();
        let child = tokio::process::Command::new(&self.command)
            .args(self.args_for(&request))
            .current_dir(&request.work_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        debug!(
            command = %self.command,
            work_dir = %request.work_dir.display(),
            tools = ?request.allowed_tools,
            timeout_secs = request.timeout.as_secs(),
            "spawning agent"
        );

        let output = match tokio::time::timeout(request.timeout, child).await {
            Err(_) => {
                warn!(command = %self.command, timeout_secs = request.timeout.as_secs(), "agent timed out");
                return Err(AgentError::Timeout(request.timeout.as_secs()));
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentError::Spawn(format!(
                    "agent command `{}` not found in PATH",
                    self.command
                )));
            }
            Ok(Err(e)) => return Err(AgentError::Io(e)),
            Ok(Ok(output)) => output,
        };

        let result = AgentOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if !result.success {
            warn!(
                command = %self.command,
                exit_code = ?result.exit_code,
                stderr = %result.stderr.chars().take(500).collect::<String>(),
                "agent exited unsuccessfully"
            );
        }
        Ok(result)
    }
}
