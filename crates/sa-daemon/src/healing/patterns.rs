use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// The failure signatures the monitor recognises in runner logs.
///
/// Each kind carries its detection regex, severity, diagnosis and base
/// confidence, so adding a kind forces every table to be filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPattern {
    DatabaseLocked,
    TooManyFiles,
    WorktreeConflict,
    LockFileStuck,
    WorkerFailure,
    Timeout,
    GitError,
}

impl ErrorPattern {
    /// Detection order: the first matching kind wins.
    pub const ALL: [ErrorPattern; 7] = [
        ErrorPattern::DatabaseLocked,
        ErrorPattern::TooManyFiles,
        ErrorPattern::WorktreeConflict,
        ErrorPattern::LockFileStuck,
        ErrorPattern::WorkerFailure,
        ErrorPattern::Timeout,
        ErrorPattern::GitError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorPattern::DatabaseLocked => "database_locked",
            ErrorPattern::TooManyFiles => "too_many_files",
            ErrorPattern::WorktreeConflict => "worktree_conflict",
            ErrorPattern::LockFileStuck => "lock_file_stuck",
            ErrorPattern::WorkerFailure => "worker_failure",
            ErrorPattern::Timeout => "timeout",
            ErrorPattern::GitError => "git_error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == raw)
    }

    /// Case-insensitive regex source matched against each log line.
    pub fn regex(self) -> &'static str {
        match self {
            ErrorPattern::DatabaseLocked => r"(database is locked|OperationalError.*locked)",
            ErrorPattern::TooManyFiles => r"(too many open files|os error 24|OSError.*24)",
            ErrorPattern::WorktreeConflict => r"(worktree.*conflict|worktree.*locked)",
            ErrorPattern::LockFileStuck => r"(lock.*timeout|unable to create.*lock)",
            ErrorPattern::WorkerFailure => r"(worker.*failed|executor.*error)",
            ErrorPattern::Timeout => r"(TimeoutExpired|timed out|timeout)",
            ErrorPattern::GitError => r"(git.*error|fatal:.*git)",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorPattern::TooManyFiles => Severity::Critical,
            ErrorPattern::DatabaseLocked
            | ErrorPattern::LockFileStuck
            | ErrorPattern::WorkerFailure => Severity::High,
            ErrorPattern::WorktreeConflict | ErrorPattern::Timeout | ErrorPattern::GitError => {
                Severity::Medium
            }
        }
    }

    pub fn root_cause(self) -> &'static str {
        match self {
            ErrorPattern::DatabaseLocked => {
                "Database lock contention - multiple processes accessing database"
            }
            ErrorPattern::TooManyFiles => {
                "File descriptor exhaustion - too many files open simultaneously"
            }
            ErrorPattern::WorktreeConflict => "Git worktree conflict or stale worktree references",
            ErrorPattern::LockFileStuck => "Stale lock file from crashed or terminated process",
            ErrorPattern::WorkerFailure => "Worker failure in the execution pool",
            ErrorPattern::Timeout => "Operation exceeded allowed time limit",
            ErrorPattern::GitError => "Git operation failure",
        }
    }

    pub fn recommended_action(self) -> &'static str {
        match self {
            ErrorPattern::DatabaseLocked => "Enable WAL mode, increase timeout, remove stale locks",
            ErrorPattern::TooManyFiles => "Reclaim descriptors and raise the open file limit",
            ErrorPattern::WorktreeConflict => "Prune worktrees, clean orphaned directories",
            ErrorPattern::LockFileStuck => "Verify process status and remove stale lock file",
            ErrorPattern::WorkerFailure => "Restart worker pool",
            ErrorPattern::Timeout => "Increase timeout or cancel operation",
            ErrorPattern::GitError => "Retry git operation with cleanup",
        }
    }

    /// Confidence in the diagnosis before any history is considered.
    pub fn base_confidence(self) -> f64 {
        match self {
            ErrorPattern::DatabaseLocked => 0.8,
            ErrorPattern::TooManyFiles => 0.7,
            ErrorPattern::WorktreeConflict => 0.75,
            ErrorPattern::LockFileStuck => 0.85,
            ErrorPattern::WorkerFailure => 0.6,
            ErrorPattern::Timeout => 0.5,
            ErrorPattern::GitError => 0.5,
        }
    }
}

impl fmt::Display for ErrorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
