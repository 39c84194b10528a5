//! Stable exit codes for the worker binary.

/// `one-job` succeeded.
pub const OK: i32 = 0;
/// Startup failed, or the farmer stopped answering heartbeats.
pub const FATAL: i32 = 1;
/// `one-job` ran but the job did not succeed.
pub const JOB_FAILED: i32 = 2;
