//! Helpers for running child processes in their own process groups, bounded
//! by a per-job deadline and cancellable from another thread.
//!
//! Every command a job runs (git, setup tasks, the test itself) goes through
//! [`spawn_in_group`]. The spawned group is attached to the job's
//! [`JobControl`], so canceling the job kills whatever group is currently
//! running, and no command can start once the job has been canceled. When a
//! command finishes for any reason its whole group is killed, so no
//! descendants outlive it.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Why a job's commands were stopped before finishing on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The job ran past its deadline.
    DeadlineExceeded,
    /// The farmer assigned this box a different job.
    Superseded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => f.write_str("job deadline exceeded"),
            CancelReason::Superseded => f.write_str("job superseded"),
        }
    }
}

/// A command was refused or killed because its job was canceled.
///
/// `detail` carries the process error (e.g. `signal: 9 (SIGKILL)`), or a note
/// that the command never started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanceledError {
    pub reason: CancelReason,
    pub detail: String,
}

impl fmt::Display for CanceledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "canceled automatically: {}: {}", self.reason, self.detail)
    }
}

impl std::error::Error for CanceledError {}

#[derive(Debug, Default)]
struct ControlState {
    canceled: Option<CancelReason>,
    group: Option<Pid>,
}

#[derive(Debug)]
struct ControlInner {
    state: Mutex<ControlState>,
    wake: Condvar,
    deadline: Instant,
}

/// Cancellation token and deadline shared by everything one job runs.
///
/// Clones share state. Cancellation is sticky: the first reason wins.
#[derive(Debug, Clone)]
pub struct JobControl {
    inner: Arc<ControlInner>,
}

impl JobControl {
    /// New token whose deadline is `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                state: Mutex::new(ControlState::default()),
                wake: Condvar::new(),
                deadline: Instant::now() + timeout,
            }),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// The reason this job was canceled, if it was.
    pub fn canceled(&self) -> Option<CancelReason> {
        self.lock().canceled
    }

    /// Cancel the job: kill the running process group (if any) and refuse to
    /// start further commands.
    pub fn cancel(&self, reason: CancelReason) {
        let mut state = self.lock();
        if state.canceled.is_none() {
            debug!(%reason, "canceling job");
            state.canceled = Some(reason);
        }
        if let Some(group) = state.group {
            kill_group(group);
        }
        drop(state);
        self.inner.wake.notify_all();
    }

    /// Error if the job is canceled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if Instant::now() >= self.inner.deadline {
            self.cancel(CancelReason::DeadlineExceeded);
        }
        match self.canceled() {
            Some(reason) => Err(CanceledError {
                reason,
                detail: "command not started".to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Sleep for `dur`, waking early (with an error) if the job is canceled
    /// or reaches its deadline first.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let until = Instant::now() + dur;
        let mut state = self.lock();
        loop {
            if let Some(reason) = state.canceled {
                return Err(CanceledError {
                    reason,
                    detail: "interrupted while waiting".to_string(),
                }
                .into());
            }
            let now = Instant::now();
            if now >= self.inner.deadline {
                drop(state);
                self.cancel(CancelReason::DeadlineExceeded);
                state = self.lock();
                continue;
            }
            if now >= until {
                return Ok(());
            }
            let wait = until.min(self.inner.deadline) - now;
            state = self
                .inner
                .wake
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Record `group` as the running command. If the job is already canceled
    /// the group is killed straight away.
    fn attach(&self, group: Pid) {
        let mut state = self.lock();
        state.group = Some(group);
        if state.canceled.is_some() {
            kill_group(group);
        }
    }

    fn detach(&self, group: Pid) {
        let mut state = self.lock();
        if state.group == Some(group) {
            state.group = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forcefully kill every process in `group`. A group that no longer exists
/// is not an error.
pub fn kill_group(group: Pid) {
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid = group.as_raw(), err = %err, "failed to kill process group"),
    }
}

/// A writer that child processes can also write to directly.
///
/// Commands inherit a handle to the target for both stdout and stderr, so
/// their output is interleaved in arrival order with whatever the worker
/// writes itself.
pub trait OutputTarget: Write {
    fn stdio(&self) -> io::Result<Stdio>;
}

impl OutputTarget for File {
    fn stdio(&self) -> io::Result<Stdio> {
        self.try_clone().map(Stdio::from)
    }
}

impl OutputTarget for io::Stdout {
    fn stdio(&self) -> io::Result<Stdio> {
        Ok(Stdio::inherit())
    }
}

/// Point a command's stdout and stderr at `out`.
pub fn redirect_output<W: OutputTarget + ?Sized>(cmd: &mut Command, out: &W) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(out.stdio().context("clone output handle")?)
        .stderr(out.stdio().context("clone output handle")?);
    Ok(())
}

/// Echo a command the way a shell transcript would: `cd <dir>` then argv.
pub fn echo_command<W: Write + ?Sized>(out: &mut W, cmd: &Command) -> Result<()> {
    if let Some(dir) = cmd.get_current_dir() {
        writeln!(out, "cd {}", dir.display()).context("write command echo")?;
    }
    writeln!(out, "{}", describe(cmd)).context("write command echo")?;
    out.flush().context("flush command echo")?;
    Ok(())
}

/// `program arg1 arg2 ...` for logs and transcripts.
pub fn describe(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A child process leading its own process group.
#[derive(Debug)]
pub struct GroupChild {
    child: Child,
    group: Pid,
    ctl: JobControl,
}

/// Spawn `cmd` as the leader of a new process group attached to `ctl`.
///
/// Fails without spawning if the job is already canceled or past its deadline.
#[instrument(skip_all, fields(program = %cmd.get_program().to_string_lossy()))]
pub fn spawn_in_group(mut cmd: Command, ctl: &JobControl) -> Result<GroupChild> {
    ctl.check()?;
    cmd.process_group(0);
    let child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", describe(&cmd)))?;
    let raw = i32::try_from(child.id()).map_err(|_| anyhow!("pid out of range"))?;
    let group = Pid::from_raw(raw);
    debug!(pgid = raw, "spawned process group");
    ctl.attach(group);
    Ok(GroupChild {
        child,
        group,
        ctl: ctl.clone(),
    })
}

impl GroupChild {
    /// Wait for the child to exit, killing its group if the job deadline
    /// passes first. The whole group is killed once the child has exited.
    pub fn wait(mut self) -> Result<ExitStatus> {
        let remaining = self
            .ctl
            .deadline()
            .saturating_duration_since(Instant::now());
        let waited = self.child.wait_timeout(remaining);
        let status = match waited.context("wait for command") {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                warn!(pgid = self.group.as_raw(), "job deadline exceeded, killing");
                self.ctl.cancel(CancelReason::DeadlineExceeded);
                self.child.wait().context("wait command after kill")
            }
            Err(err) => Err(err),
        };
        kill_group(self.group);
        self.ctl.detach(self.group);
        let status = status?;
        debug!(exit_code = ?status.code(), "command finished");
        Ok(status)
    }
}

/// Turn a finished command's status into an error, if it failed.
///
/// A failure while the job is canceled is reported as a [`CanceledError`] so
/// callers can tell it apart from the command failing on its own.
pub fn status_error(status: ExitStatus, ctl: &JobControl) -> Option<anyhow::Error> {
    if status.success() {
        return None;
    }
    match ctl.canceled() {
        Some(reason) => Some(
            CanceledError {
                reason,
                detail: status.to_string(),
            }
            .into(),
        ),
        None => Some(anyhow!("{status}")),
    }
}

/// Run `cmd` to completion in its own group; a non-zero exit is an error.
pub fn run_checked(cmd: Command, ctl: &JobControl) -> Result<()> {
    let status = spawn_in_group(cmd, ctl)?.wait()?;
    match status_error(status, ctl) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// `/bin/bash -eo pipefail -c <script>` so that any failing pipeline stage
/// fails the command.
pub fn shell_command(script: &str) -> Command {
    let mut cmd = Command::new("/bin/bash");
    cmd.args(["-eo", "pipefail", "-c", script]);
    cmd
}
