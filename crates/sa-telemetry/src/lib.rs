//! Logging setup shared by the `selfai` binaries.
//!
//! Human-readable and JSON console output via `tracing-subscriber`, plus a
//! file-backed variant that also writes `logs/runner.log`. That file is what
//! the self-healing monitor tails.

pub mod logging;
