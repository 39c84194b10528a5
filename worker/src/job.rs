//! Starting, supervising, and canceling a single job.
//!
//! [`JobRunner::start_job`] posts `pending`, creates the output file,
//! registers the job, and hands the rest to a dedicated thread: prepare and
//! run the command, wait for it under the job deadline, then report. The
//! returned [`JobHandle`] cancels the job and blocks until that thread has
//! reported and released the registry, so the next job never overlaps it.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tracing::{error, info, warn};

use crate::core::output_name::output_file_name;
use crate::core::types::{Job, Outcome, Status};
use crate::executor::{ExecEnv, start_job_proc};
use crate::io::artifacts::ArtifactStore;
use crate::io::farmer::Farmer;
use crate::io::init::random_id;
use crate::io::process::{CancelReason, CanceledError, JobControl, status_error};
use crate::io::trace::TraceSpan;
use crate::registry::Registry;
use crate::report::{JobOutput, Reporter, StatusRetry};

/// Everything needed to start jobs on this box.
#[derive(Clone)]
pub struct JobRunner {
    pub env: ExecEnv,
    pub out_dir: PathBuf,
    pub timeout: Duration,
    pub farmer: Arc<dyn Farmer>,
    pub store: Arc<dyn ArtifactStore>,
    pub registry: Arc<Registry>,
    pub trace_url_template: String,
    pub status_retry: StatusRetry,
}

/// A started job (or nothing, for the empty job).
#[derive(Debug, Default)]
pub struct JobHandle {
    ctl: Option<JobControl>,
    thread: Option<JoinHandle<()>>,
}

impl JobHandle {
    /// Handle for "no job"; canceling it does nothing.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Kill the job's running commands and wait until it has reported.
    pub fn cancel(self) {
        if let Some(ctl) = &self.ctl {
            ctl.cancel(CancelReason::Superseded);
        }
        self.wait();
    }

    /// Wait for the job to finish on its own.
    pub fn wait(self) {
        if let Some(thread) = self.thread
            && thread.join().is_err()
        {
            error!("job thread panicked");
        }
    }
}

impl JobRunner {
    /// Start `job`. The empty job starts nothing.
    pub fn start_job(&self, job: &Job) -> JobHandle {
        let start = Instant::now();
        if job.is_empty() {
            return JobHandle::idle();
        }

        let reporter = Reporter {
            farmer: self.farmer.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            job: job.clone(),
            span: TraceSpan::start(),
            start,
            trace_url_template: self.trace_url_template.clone(),
            retry: self.status_retry,
        };
        info!(%job, "starting job");
        reporter.post_status(Status::Pending, "running", "");

        let path = self.out_dir.join(output_file_name(job, &random_id()));
        let output = match JobOutput::create(path) {
            Ok(output) => output,
            Err(err) => {
                error!(%job, err = %format!("{err:#}"), "cannot create output file");
                reporter.post_status(Status::Error, &format!("{err:#}"), "");
                return JobHandle::idle();
            }
        };
        if let Err(err) = self.registry.set(job, &output.path) {
            error!(%job, err = %format!("{err:#}"), "cannot register job");
            reporter.post_status(Status::Error, &format!("{err:#}"), "");
            return JobHandle::idle();
        }

        let ctl = JobControl::new(self.timeout);
        let env = self.env.clone();
        let job = job.clone();
        let thread_ctl = ctl.clone();
        let thread = thread::spawn(move || run_job(&env, &job, output, &reporter, &thread_ctl));
        JobHandle {
            ctl: Some(ctl),
            thread: Some(thread),
        }
    }
}

fn run_job(env: &ExecEnv, job: &Job, mut output: JobOutput, reporter: &Reporter, ctl: &JobControl) {
    let job_dir = env.job_dir(job).unwrap_or_else(|_| env.repo_dir.clone());
    let outcome = match start_job_proc(env, job, &reporter.span, &mut output.file, ctl) {
        Ok(child) => match child.wait() {
            Ok(status) => classify(status, ctl, reporter.start),
            Err(err) => Outcome::error(format!("{err:#}")),
        },
        Err(err) => {
            warn!(%job, err = %format!("{err:#}"), "job did not start");
            Outcome::error(format!("{err:#}"))
        }
    };
    reporter.finish(output, outcome, &job_dir, &env.repo_dir);
}

/// Map the test command's exit status to an outcome.
///
/// A command that failed because its job was canceled is an `error`, not a
/// test `failure`.
pub fn classify(status: ExitStatus, ctl: &JobControl, start: Instant) -> Outcome {
    match status_error(status, ctl) {
        None => Outcome::success(format!("{}ms", start.elapsed().as_millis())),
        Some(err) if err.downcast_ref::<CanceledError>().is_some() => {
            Outcome::error(err.to_string())
        }
        Some(err) => Outcome::failure(err.to_string()),
    }
}

/// Run one job in the foreground with output on stdout, without a farmer.
pub fn run_one_job(env: &ExecEnv, job: &Job, timeout: Duration) -> Result<()> {
    let ctl = JobControl::new(timeout);
    let mut out = io::stdout();
    let child = start_job_proc(env, job, &TraceSpan::start(), &mut out, &ctl)?;
    let status = child.wait()?;
    if let Some(err) = status_error(status, &ctl) {
        bail!("{job}: {err}");
    }
    Ok(())
}
