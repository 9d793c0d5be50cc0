//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `run`, the task completed.
pub const OK: i32 = 0;
/// `run` finished but the task failed.
pub const FAILED: i32 = 1;
/// Invalid config or arguments, or another setup error.
pub const INVALID: i32 = 2;
