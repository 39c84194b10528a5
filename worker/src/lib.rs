//! CI box worker.
//!
//! A box long-polls its farmer for the job it should be running, runs it in
//! its own process group under a deadline, streams its output on request, and
//! reports the result. The crate is split the usual way:
//!
//! - **[`core`]**: Pure logic (wire types, Testfile parsing, output naming,
//!   error scanning). No I/O.
//! - **[`io`]**: Side effects (git, processes, the farmer, artifact storage,
//!   configuration).
//!
//! The orchestration modules ([`executor`], [`job`], [`report`],
//! [`follow`], [`looping`]) tie the two together around the shared
//! [`registry`] of the current job.

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod follow;
pub mod io;
pub mod job;
pub mod logging;
pub mod looping;
pub mod registry;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
