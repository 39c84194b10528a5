//! CI box worker.
//!
//! `run` turns this machine into a box: it bootstraps a fresh checkout,
//! registers with the farmer, and runs whatever job the farmer asks for.
//! `one-job` runs a single job in the existing checkout with output on
//! stdout, for debugging a Testfile without a farmer.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use worker::core::types::{BoxPingReq, Job};
use worker::executor::ExecEnv;
use worker::exit_codes;
use worker::follow::LiveServer;
use worker::io::artifacts::{ArtifactStore, DirStore, HttpStore};
use worker::io::config::{Layout, WorkerConfig, home_dir, load_config};
use worker::io::farmer::{Farmer, HttpFarmer};
use worker::io::init::{bootstrap, hostname, random_id};
use worker::job::{JobRunner, run_one_job};
use worker::logging;
use worker::looping::{Coordinator, heartbeat};
use worker::registry::Registry;
use worker::report::StatusRetry;

#[derive(Parser)]
#[command(name = "testbot-worker", version, about = "CI box worker")]
struct Cli {
    /// TOML config file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wipe the working root, clone the repository, and serve the farmer.
    Run,
    /// Run one job in the existing checkout, printing its output.
    OneJob {
        #[arg(long)]
        sha: String,
        /// Job directory relative to the repository root.
        #[arg(long, default_value = "")]
        dir: String,
        /// Testfile entry to run.
        #[arg(long)]
        name: String,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run => match cmd_run(cli.config) {
            Ok(never) => match never {},
            Err(err) => {
                eprintln!("{err:#}");
                exit_codes::FATAL
            }
        },
        Command::OneJob { sha, dir, name } => match one_job_env(cli.config) {
            Err(err) => {
                eprintln!("{err:#}");
                exit_codes::FATAL
            }
            Ok((env, timeout)) => match run_one_job(&env, &Job::new(sha, dir, name), timeout) {
                Ok(()) => exit_codes::OK,
                Err(err) => {
                    eprintln!("{err:#}");
                    exit_codes::JOB_FAILED
                }
            },
        },
    };
    std::process::exit(code);
}

fn cmd_run(config: Option<PathBuf>) -> Result<Infallible> {
    let cfg = load_config(config.as_deref())?;
    let layout = cfg.layout(&home_dir()?);
    let box_id = random_id();
    let host = hostname();
    info!(%box_id, %host, farmer = %cfg.farmer_url, "starting box");

    bootstrap(&layout, &cfg.repo_url()).context("initialize filesystem")?;

    let farmer: Arc<dyn Farmer> = Arc::new(HttpFarmer::new(
        cfg.farmer_url.clone(),
        cfg.request_timeout(),
    )?);
    let ping = BoxPingReq {
        id: box_id.clone(),
        host: host.clone(),
    };
    farmer.ping(&ping).context("register with farmer")?;

    let beat_farmer = farmer.clone();
    let interval = cfg.heartbeat_interval();
    thread::spawn(move || {
        let err = heartbeat(beat_farmer.as_ref(), &ping, interval);
        error!(err = %format!("{err:#}"), "heartbeat failed");
        eprintln!("heartbeat: {err:#}");
        std::process::exit(exit_codes::FATAL);
    });

    let registry = Arc::new(Registry::new());
    let live = LiveServer {
        farmer: farmer.clone(),
        registry: registry.clone(),
        box_id: box_id.clone(),
        poll: cfg.follow_poll(),
        error_backoff: cfg.live_error_backoff(),
        dispatch_delay: cfg.live_dispatch_delay(),
    };
    thread::spawn(move || live.run());

    let runner = JobRunner {
        env: exec_env(&cfg, &layout, host),
        out_dir: layout.out_dir.clone(),
        timeout: cfg.job_timeout(),
        farmer,
        store: artifact_store(&cfg, &layout)?,
        registry,
        trace_url_template: cfg.trace_url_template.clone(),
        status_retry: StatusRetry {
            attempts: cfg.status_attempts,
            delay: cfg.status_retry(),
        },
    };
    Coordinator::new(runner, box_id, cfg.state_retry()).run()
}

/// Environment and deadline for `one-job`. Failing here is fatal, not a job
/// failure.
fn one_job_env(config: Option<PathBuf>) -> Result<(ExecEnv, Duration)> {
    let cfg = load_config(config.as_deref())?;
    let layout = cfg.layout(&home_dir()?);
    Ok((exec_env(&cfg, &layout, hostname()), cfg.job_timeout()))
}

fn exec_env(cfg: &WorkerConfig, layout: &Layout, hostname: String) -> ExecEnv {
    ExecEnv {
        repo_dir: layout.repo_dir.clone(),
        bin_dir: layout.bin_dir.clone(),
        hostname,
        auth_token: cfg.netlify_auth_token.clone(),
        fetch_retry: cfg.fetch_retry(),
    }
}

/// A directory store unless only an upload URL is configured.
fn artifact_store(cfg: &WorkerConfig, layout: &Layout) -> Result<Arc<dyn ArtifactStore>> {
    let artifacts = &cfg.artifacts;
    let store: Arc<dyn ArtifactStore> = match (&artifacts.dir, &artifacts.base_url) {
        (None, Some(base)) => Arc::new(HttpStore::new(base.clone(), cfg.request_timeout())?),
        _ => Arc::new(DirStore::new(
            layout.artifact_dir.clone(),
            artifacts.base_url.clone(),
        )),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_config() {
        let cli = Cli::parse_from(["testbot-worker", "run", "--config", "worker.toml"]);
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.config, Some(PathBuf::from("worker.toml")));
    }

    #[test]
    fn parse_one_job() {
        let cli = Cli::parse_from([
            "testbot-worker",
            "one-job",
            "--sha",
            "abc",
            "--dir",
            "svc",
            "--name",
            "test",
        ]);
        match cli.command {
            Command::OneJob { sha, dir, name } => {
                assert_eq!(Job::new(sha, dir, name), Job::new("abc", "svc", "test"));
            }
            Command::Run => panic!("expected one-job"),
        }
    }

    #[test]
    fn one_job_dir_defaults_to_root() {
        let cli = Cli::parse_from(["testbot-worker", "one-job", "--sha", "a", "--name", "t"]);
        assert!(matches!(cli.command, Command::OneJob { ref dir, .. } if dir.is_empty()));
    }
}
