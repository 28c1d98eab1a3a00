//! Background orchestration for the SelfAI runner.
//!
//! - Bounded parallel execution of approved tasks in isolated worktrees
//! - The plan / execute / test cycle with level gating and merge
//! - A MAPE-K self-healing monitor over the runner logs
//! - Agent-driven backlog discovery
//! - The long-running daemon loop

pub mod coordinator;
pub mod daemon;
pub mod discovery;
pub mod healing;
pub mod orchestrator;
pub mod scheduler;
