//! Test-only helpers: throwaway git repositories, a scripted farmer, and
//! in-memory artifact stores.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{BoxJobUpdateReq, BoxPingReq, BoxState, Job};
use crate::io::artifacts::ArtifactStore;
use crate::io::farmer::Farmer;

/// An "origin" repository plus a clone of it, both in a temp directory.
///
/// Commits made with [`TestRepo::commit_remote`] land only in the origin, so
/// the checkout has to fetch to see them, like a worker behind a farmer.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let origin = dir.path().join("origin");
        fs::create_dir_all(&origin).context("create origin")?;
        git(&origin, &["init", "--quiet"])?;
        fs::write(origin.join("README"), "test repository\n").context("write README")?;
        git(&origin, &["add", "-A"])?;
        git(&origin, &["commit", "--quiet", "-m", "initial"])?;
        git(
            dir.path(),
            &["clone", "--quiet", "origin", "checkout"],
        )?;
        Ok(Self { dir })
    }

    pub fn origin(&self) -> PathBuf {
        self.dir.path().join("origin")
    }

    pub fn checkout(&self) -> PathBuf {
        self.dir.path().join("checkout")
    }

    /// Commit one file to the origin and return the new commit's sha.
    pub fn commit_remote(&self, path: &str, contents: &str, msg: &str) -> Result<String> {
        self.commit_remote_files(&[(path, contents)], msg)
    }

    /// Commit several files to the origin and return the new commit's sha.
    pub fn commit_remote_files(&self, files: &[(&str, &str)], msg: &str) -> Result<String> {
        let origin = self.origin();
        for (path, contents) in files {
            let dest = origin.join(path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&dest, contents).with_context(|| format!("write {}", dest.display()))?;
        }
        git(&origin, &["add", "-A"])?;
        git(&origin, &["commit", "--quiet", "-m", msg])?;
        rev_parse_head(&origin)
    }

    /// HEAD of the checkout.
    pub fn head(&self) -> Result<String> {
        rev_parse_head(&self.checkout())
    }
}

fn rev_parse_head(dir: &Path) -> Result<String> {
    let out = git(dir, &["rev-parse", "HEAD"])?;
    Ok(out.trim().to_string())
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=Test Worker",
            "-c",
            "user.email=worker@example.com",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "init.defaultBranch=main",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Read a pid written by a test command (`echo $! > file`).
pub fn read_pid(path: &Path) -> Result<i32> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    text.trim()
        .parse()
        .with_context(|| format!("parse pid from {:?}", text.trim()))
}

/// True if `pid` has exited. A zombie counts as exited.
pub fn process_gone(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
    }
}

/// Poll until `pid` has exited or `timeout` passes. Returns whether it exited.
pub fn wait_process_gone(pid: i32, timeout: Duration) -> bool {
    let until = Instant::now() + timeout;
    loop {
        if process_gone(pid) {
            return true;
        }
        if Instant::now() >= until {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[derive(Debug, Default)]
struct FarmerLog {
    states: VecDeque<Result<BoxState, String>>,
    long_polls: Vec<BoxState>,
    live_requests: VecDeque<Job>,
    live_sends: Vec<(Job, Vec<u8>)>,
    pings: Vec<BoxPingReq>,
    pings_left: Option<usize>,
    statuses: Vec<BoxJobUpdateReq>,
    status_attempts: usize,
    failing_status_posts: usize,
}

/// In-process farmer that answers from a script and records every call.
///
/// Long polls pop scripted states; with the script exhausted they fail, which
/// the state loop treats like a network error.
#[derive(Debug, Default)]
pub struct ScriptedFarmer {
    log: Mutex<FarmerLog>,
}

impl ScriptedFarmer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a state for a future long poll.
    pub fn push_state(&self, state: BoxState) {
        self.lock().states.push_back(Ok(state));
    }

    /// Queue a failing long poll.
    pub fn push_state_error(&self, msg: &str) {
        self.lock().states.push_back(Err(msg.to_string()));
    }

    /// Queue a live output request.
    pub fn push_live_request(&self, job: Job) {
        self.lock().live_requests.push_back(job);
    }

    /// Let `n` more pings succeed, then fail the rest.
    pub fn fail_pings_after(&self, n: usize) {
        self.lock().pings_left = Some(n);
    }

    /// Fail the next `n` status posts.
    pub fn fail_next_status_posts(&self, n: usize) {
        self.lock().failing_status_posts = n;
    }

    pub fn pings(&self) -> Vec<BoxPingReq> {
        self.lock().pings.clone()
    }

    /// States sent with each long poll.
    pub fn long_polls(&self) -> Vec<BoxState> {
        self.lock().long_polls.clone()
    }

    /// Successfully posted statuses, in order.
    pub fn statuses(&self) -> Vec<BoxJobUpdateReq> {
        self.lock().statuses.clone()
    }

    /// Every status post attempt, failed ones included.
    pub fn status_attempts(&self) -> usize {
        self.lock().status_attempts
    }

    /// Jobs and bodies received by live sends.
    pub fn live_sends(&self) -> Vec<(Job, Vec<u8>)> {
        self.lock().live_sends.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FarmerLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Farmer for ScriptedFarmer {
    fn ping(&self, req: &BoxPingReq) -> Result<()> {
        let mut log = self.lock();
        if let Some(left) = log.pings_left.as_mut() {
            if *left == 0 {
                bail!("ping refused");
            }
            *left -= 1;
        }
        log.pings.push(req.clone());
        Ok(())
    }

    fn long_poll(&self, state: &BoxState) -> Result<BoxState> {
        let mut log = self.lock();
        log.long_polls.push(state.clone());
        match log.states.pop_front() {
            Some(Ok(next)) => Ok(next),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => bail!("no scripted state"),
        }
    }

    fn live_poll(&self, _box_id: &str) -> Result<Job> {
        Ok(self.lock().live_requests.pop_front().unwrap_or_default())
    }

    fn live_send(&self, _box_id: &str, job: &Job, mut body: Box<dyn Read + Send>) -> Result<()> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).context("read live body")?;
        self.lock().live_sends.push((job.clone(), buf));
        Ok(())
    }

    fn post_status(&self, req: &BoxJobUpdateReq) -> Result<()> {
        let mut log = self.lock();
        log.status_attempts += 1;
        if log.failing_status_posts > 0 {
            log.failing_status_posts -= 1;
            bail!("status post refused");
        }
        log.statuses.push(req.clone());
        Ok(())
    }
}

/// Artifact store that keeps uploads in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored contents of `name`, if any.
    pub fn get(&self, name: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl ArtifactStore for MemoryStore {
    fn put(&self, name: &str, body: &mut dyn Read) -> Result<String> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).context("read artifact")?;
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), buf);
        Ok(format!("mem://{name}"))
    }
}

/// Artifact store whose uploads always fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

impl ArtifactStore for FailingStore {
    fn put(&self, name: &str, _body: &mut dyn Read) -> Result<String> {
        bail!("store unavailable for {name}")
    }
}
