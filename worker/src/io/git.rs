//! Git adapter for preparing a job's checkout.
//!
//! Every git invocation runs through the job's [`JobControl`] like any other
//! job command, and its transcript goes to the job's output.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{JobControl, OutputTarget, echo_command, redirect_output, run_checked};

/// Operations repository preparation needs from a working tree.
pub trait Repository {
    /// True if `sha` definitely exists locally. Errors count as "no".
    fn object_exists(&self, out: &mut dyn OutputTarget, ctl: &JobControl, sha: &str) -> bool;
    /// Fetch remote refs.
    fn fetch(&self, out: &mut dyn OutputTarget, ctl: &JobControl) -> Result<()>;
    /// Remove untracked and ignored files.
    fn clean(&self, out: &mut dyn OutputTarget, ctl: &JobControl) -> Result<()>;
    /// Hard-reset the working tree to `sha`.
    fn reset_hard(&self, out: &mut dyn OutputTarget, ctl: &JobControl, sha: &str) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `url` into `dest` and return a wrapper for the new checkout.
    #[instrument(skip_all, fields(url))]
    pub fn clone_from(
        url: &str,
        dest: &Path,
        out: &mut dyn OutputTarget,
        ctl: &JobControl,
    ) -> Result<Self> {
        info!(dest = %dest.display(), "cloning repository");
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg(url).arg(dest);
        redirect_output(&mut cmd, out)?;
        echo_command(out, &cmd)?;
        run_checked(cmd, ctl).with_context(|| format!("git clone {url}"))?;
        Ok(Self::new(dest))
    }

    /// Create and checkout a new branch at current HEAD.
    pub fn checkout_new_branch(
        &self,
        out: &mut dyn OutputTarget,
        ctl: &JobControl,
        branch: &str,
    ) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run(out, ctl, &["checkout", "-b", branch])
    }

    fn run(&self, out: &mut dyn OutputTarget, ctl: &JobControl, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        redirect_output(&mut cmd, out)?;
        echo_command(out, &cmd)?;
        run_checked(cmd, ctl).with_context(|| format!("git {}", args.join(" ")))
    }
}

impl Repository for Git {
    fn object_exists(&self, out: &mut dyn OutputTarget, ctl: &JobControl, sha: &str) -> bool {
        self.run(out, ctl, &["cat-file", "-e", sha]).is_ok()
    }

    fn fetch(&self, out: &mut dyn OutputTarget, ctl: &JobControl) -> Result<()> {
        self.run(out, ctl, &["fetch"])
    }

    fn clean(&self, out: &mut dyn OutputTarget, ctl: &JobControl) -> Result<()> {
        self.run(out, ctl, &["clean", "-xdf"])
    }

    fn reset_hard(&self, out: &mut dyn OutputTarget, ctl: &JobControl, sha: &str) -> Result<()> {
        self.run(out, ctl, &["reset", "--hard", sha])
    }
}

/// Leave `repo` clean and checked out exactly at `sha`.
///
/// If `sha` is missing locally, remote refs are fetched. A failed fetch is
/// retried once after `retry_delay`; fetching is flaky and a second attempt
/// usually works.
#[instrument(skip_all, fields(sha))]
pub fn prepare_checkout<R: Repository + ?Sized>(
    repo: &R,
    sha: &str,
    retry_delay: Duration,
    out: &mut dyn OutputTarget,
    ctl: &JobControl,
) -> Result<()> {
    if !repo.object_exists(out, ctl, sha)
        && let Err(err) = repo.fetch(out, ctl)
    {
        warn!(err = %format!("{err:#}"), "fetch failed, retrying once");
        ctl.sleep(retry_delay)?;
        repo.fetch(out, ctl)?;
    }
    repo.clean(out, ctl)?;
    repo.reset_hard(out, ctl, sha)?;
    debug!("checkout ready");
    Ok(())
}
