//! Side-effecting adapters: processes, git, the farmer, artifact storage.

pub mod artifacts;
pub mod config;
pub mod farmer;
pub mod git;
pub mod init;
pub mod process;
pub mod trace;
