//! Process harness for the runner binaries: cooperative shutdown shared by
//! the orchestration loop, the worker pool and the self-healing monitor.

pub mod shutdown;
