//! The coding-agent side of the runner.
//!
//! [`runner::CliAgentRunner`] implements `sa_core::agent::AgentRunner` by
//! spawning the agent CLI; [`prompts`] builds the instruction payloads for
//! the plan, execute, test and conflict-resolution phases.

pub mod prompts;
pub mod runner;

pub use prompts::{Phase, PromptRegistry, PromptTemplate};
pub use runner::CliAgentRunner;
