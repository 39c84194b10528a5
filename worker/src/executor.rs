//! Turns a job into a running, deadline-bounded test command.
//!
//! Before the job's own command starts, the checkout is prepared and every
//! `setup` entry in Testfiles at or below the job directory is run. Setup
//! tasks let, for example, a crate that a Go package links against be built
//! before `go test` runs.
//!
//! The walk visits directories in file-name order, but that order is not a
//! contract: projects with cross-directory setup dependencies must express
//! them in their own build tooling.

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::core::testfile::{TESTFILE_NAME, Testfile, parse_testfile};
use crate::core::types::Job;
use crate::io::git::{Git, prepare_checkout};
use crate::io::process::{
    GroupChild, JobControl, OutputTarget, redirect_output, run_checked, shell_command,
    spawn_in_group,
};
use crate::io::trace::TraceSpan;

/// Worker-wide settings every job runs with.
#[derive(Debug, Clone)]
pub struct ExecEnv {
    /// The worker's checkout.
    pub repo_dir: PathBuf,
    /// Directory of extra binaries (also `GOBIN`).
    pub bin_dir: PathBuf,
    pub hostname: String,
    /// Passed to commands as `NETLIFY_AUTH_TOKEN`.
    pub auth_token: String,
    /// Delay before retrying a failed fetch.
    pub fetch_retry: Duration,
}

impl ExecEnv {
    /// Absolute directory of `job` inside the checkout.
    ///
    /// Absolute paths and `..` components are rejected so a job can never
    /// run outside the checkout.
    pub fn job_dir(&self, job: &Job) -> Result<PathBuf> {
        let rel = Path::new(&job.dir);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("invalid job directory {:?}", job.dir);
        }
        Ok(self.repo_dir.join(rel))
    }

    /// A `bash -eo pipefail -c` command for `script`, run in `dir` with the
    /// job environment.
    pub fn command(&self, dir: &Path, script: &str, span: &TraceSpan) -> Command {
        let mut cmd = shell_command(script);
        let path = std::env::var("PATH").unwrap_or_default();
        let repo = self.repo_dir.display().to_string();
        cmd.current_dir(dir)
            .env("CHAIN", &repo)
            .env("I10R", &repo)
            .env("GOBIN", &self.bin_dir)
            .env("NETLIFY_AUTH_TOKEN", &self.auth_token)
            .env(
                "PATH",
                format!("{}:{repo}/bin:{path}", self.bin_dir.display()),
            )
            .envs(span.env());
        cmd
    }
}

/// Prepare the checkout, run setup tasks, and start the job's command.
///
/// Returns the running command; the caller waits on it. Any error here means
/// the test itself never ran.
#[instrument(skip_all, fields(job = %job))]
pub fn start_job_proc(
    env: &ExecEnv,
    job: &Job,
    span: &TraceSpan,
    out: &mut dyn OutputTarget,
    ctl: &JobControl,
) -> Result<GroupChild> {
    writeln!(out, "starting job {job}").context("write output")?;
    writeln!(out, "worker host {}", env.hostname).context("write output")?;

    let start = Instant::now();
    let git = Git::new(&env.repo_dir);
    prepare_checkout(&git, &job.sha, env.fetch_retry, out, ctl).context("clone")?;
    writeln!(out, "setup ok {:?}", start.elapsed()).context("write output")?;

    let cmd_dir = env.job_dir(job)?;
    run_setup_tasks(env, &cmd_dir, span, out, ctl)?;

    let testfile_path = cmd_dir.join(TESTFILE_NAME);
    let testfile = match read_testfile(&testfile_path) {
        Ok(tf) => tf,
        Err(err) => {
            writeln!(out, "parse {}: {err:#}", testfile_path.display()).context("write output")?;
            return Err(err);
        }
    };
    let Some(script) = testfile.get(&job.name) else {
        writeln!(out, "cannot find Testfile entry {}", job.name).context("write output")?;
        return Err(anyhow!("cannot find Testfile entry {}", job.name));
    };

    info!(dir = %cmd_dir.display(), "starting test command");
    let cmd = prepared(env, &cmd_dir, script, span, out)?;
    spawn_in_group(cmd, ctl)
}

/// Run the `setup` entry of every Testfile at or below `root`.
///
/// The first failing setup task stops the walk.
pub fn run_setup_tasks(
    env: &ExecEnv,
    root: &Path,
    span: &TraceSpan,
    out: &mut dyn OutputTarget,
    ctl: &JobControl,
) -> Result<()> {
    let walk = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walk {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() || entry.file_name() != TESTFILE_NAME {
            continue;
        }
        let path = entry.path();
        let testfile = read_testfile(path)?;
        let Some(script) = testfile.setup() else {
            continue;
        };
        let dir = path.parent().unwrap_or(root);
        debug!(dir = %dir.display(), "running setup task");
        let cmd = prepared(env, dir, script, span, out)?;
        run_checked(cmd, ctl).with_context(|| format!("setup in {}", dir.display()))?;
    }
    Ok(())
}

fn read_testfile(path: &Path) -> Result<Testfile> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    parse_testfile(BufReader::new(file)).with_context(|| format!("parse {}", path.display()))
}

/// Build the command, point it at `out`, and echo it into the transcript.
fn prepared(
    env: &ExecEnv,
    dir: &Path,
    script: &str,
    span: &TraceSpan,
    out: &mut dyn OutputTarget,
) -> Result<Command> {
    let mut cmd = env.command(dir, script, span);
    redirect_output(&mut cmd, out)?;
    writeln!(out, "cd {}", dir.display()).context("write output")?;
    writeln!(out, "{script}").context("write output")?;
    out.flush().context("flush output")?;
    Ok(cmd)
}
