use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run a git command in `dir`. `Err` means git could not be run at all;
    /// a non-zero exit is reported through [`GitOutput::success`].
    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Non-empty trimmed stdout lines.
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// stderr if present, otherwise stdout; used in error messages.
    pub fn message(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// CliGitRunner
// ---------------------------------------------------------------------------

/// Shells out to the `git` binary with a per-command timeout.
pub struct CliGitRunner {
    timeout: Duration,
}

impl CliGitRunner {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for CliGitRunner {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl GitRunner for CliGitRunner {
    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let child = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                format!(
                    "git {} timed out after {}s",
                    args.first().unwrap_or(&""),
                    self.timeout.as_secs()
                )
            })?
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// RetryingGit
// ---------------------------------------------------------------------------

/// Backoff for git commands that fail on a held `.lock` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Wraps a runner and retries commands whose stderr mentions a lock, and
/// commands that timed out. Other failures are returned on the first attempt.
pub struct RetryingGit<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: GitRunner> RetryingGit<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

fn is_lock_contention(out: &GitOutput) -> bool {
    !out.success && out.stderr.to_lowercase().contains("lock")
}

fn is_timeout(err: &str) -> bool {
    err.contains("timed out")
}

#[async_trait]
impl<G: GitRunner> GitRunner for RetryingGit<G> {
    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = self.inner.run_git(dir, args).await;
            attempt += 1;
            let retryable = match &result {
                Ok(out) => is_lock_contention(out),
                Err(e) => is_timeout(e),
            };
            if !retryable || attempt >= attempts {
                return result;
            }
            let delay = self.policy.delay_for(attempt - 1);
            warn!(
                command = %args.join(" "),
                attempt,
                delay_ms = delay.as_millis() as u64,
                timed_out = result.is_err(),
                "transient git failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
