//! Process-wide tracing setup.
//!
//! Everything the worker says about itself goes to stderr through `tracing`.
//! Job transcripts are separate: they go to the per-job output file and are
//! never affected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `info` so a box's log shows each job it
/// runs. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=worker=debug testbot-worker run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
