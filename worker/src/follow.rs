//! Live output: streaming a running job's output file to the farmer.
//!
//! The farmer asks for live output through a long poll. Each request starts
//! an independent follow session on its own thread, so a slow reader never
//! stops this box from noticing the next request. Duplicate sessions for the
//! same job are harmless: the farmer consumes one and drops the rest.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::Job;
use crate::io::farmer::Farmer;
use crate::registry::Registry;

/// Default delay before re-reading a file the follower has caught up with.
pub const FOLLOW_POLL: Duration = Duration::from_millis(100);

/// Reads an output file like `tail -f`.
///
/// At end of file it waits for more data while the file is still the
/// registry's current output, and reports end of stream only once it is not.
/// The registry is checked before each read, so everything written before the
/// job was released is delivered.
#[derive(Debug)]
pub struct Follower {
    file: File,
    path: PathBuf,
    registry: Arc<Registry>,
    poll: Duration,
    done: bool,
}

impl Follower {
    pub fn new(file: File, path: PathBuf, registry: Arc<Registry>, poll: Duration) -> Self {
        Self {
            file,
            path,
            registry,
            poll,
            done: false,
        }
    }
}

impl Read for Follower {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        loop {
            let running = self.registry.is_current_output(&self.path);
            let n = self.file.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if !running {
                self.done = true;
                return Ok(0);
            }
            thread::sleep(self.poll);
        }
    }
}

/// Open a fresh follower on `job`'s output, or `None` if `job` is not the
/// job currently running.
pub fn open_follower(registry: &Arc<Registry>, job: &Job, poll: Duration) -> Result<Option<Follower>> {
    let Some(path) = registry.output_for(job) else {
        return Ok(None);
    };
    let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
    Ok(Some(Follower::new(file, path, registry.clone(), poll)))
}

/// Serves the farmer's requests for live output.
#[derive(Clone)]
pub struct LiveServer {
    pub farmer: Arc<dyn Farmer>,
    pub registry: Arc<Registry>,
    pub box_id: String,
    pub poll: Duration,
    /// Backoff after a failed poll.
    pub error_backoff: Duration,
    /// Head start for a new session before polling again, so the next poll
    /// is less likely to return the request that session is serving.
    pub dispatch_delay: Duration,
}

impl LiveServer {
    /// Poll for requests forever.
    pub fn run(&self) -> ! {
        loop {
            match self.poll_once() {
                Ok(Some(_session)) => thread::sleep(self.dispatch_delay),
                Ok(None) => {}
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "live output poll failed");
                    thread::sleep(self.error_backoff);
                }
            }
        }
    }

    /// One long poll. A request starts a follow session on a new thread.
    pub fn poll_once(&self) -> Result<Option<JoinHandle<()>>> {
        let job = self.farmer.live_poll(&self.box_id)?;
        if job.is_empty() {
            return Ok(None);
        }
        let server = self.clone();
        Ok(Some(thread::spawn(move || server.send_output(&job))))
    }

    /// Stream `job`'s output until it ends or the farmer hangs up. A request
    /// for a job that is not running is dropped.
    pub fn send_output(&self, job: &Job) {
        let follower = match open_follower(&self.registry, job, self.poll) {
            Ok(Some(follower)) => follower,
            Ok(None) => {
                debug!(%job, "live output requested for a job that is not running");
                return;
            }
            Err(err) => {
                warn!(%job, err = %format!("{err:#}"), "cannot open live output");
                return;
            }
        };
        if let Err(err) = self
            .farmer
            .live_send(&self.box_id, job, Box::new(follower))
        {
            warn!(%job, err = %format!("{err:#}"), "live output stream ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::sync::mpsc;

    use super::*;
    use crate::test_support::ScriptedFarmer;

    fn running_job(dir: &Path) -> (Arc<Registry>, Job, PathBuf, File) {
        let registry = Arc::new(Registry::new());
        let job = Job::new("abc", "pkg", "test");
        let path = dir.join("abc-pkg-test.r.output");
        let writer = File::create(&path).expect("create");
        registry.set(&job, &path).expect("register");
        (registry, job, path, writer)
    }

    #[test]
    fn follower_waits_at_eof_while_current_then_ends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (registry, job, path, mut writer) = running_job(dir.path());
        writer.write_all(b"first\n").expect("write");

        let mut follower = open_follower(&registry, &job, Duration::from_millis(5))
            .expect("open")
            .expect("current job");
        let mut buf = [0u8; 64];
        let n = follower.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"first\n");

        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            let mut rest = Vec::new();
            follower.read_to_end(&mut rest).expect("read_to_end");
            tx.send(rest).expect("send");
        });

        // Caught up but still current: no end of stream.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        writer.write_all(b"second\n").expect("write");
        drop(writer);
        assert!(registry.clear(&path));

        let rest = rx.recv_timeout(Duration::from_secs(5)).expect("stream ends");
        assert_eq!(rest, b"second\n");
        reader.join().expect("join");
    }

    #[test]
    fn follower_signals_end_once_and_stays_ended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (registry, _job, path, mut writer) = running_job(dir.path());
        writer.write_all(b"all\n").expect("write");
        registry.clear(&path);

        let file = File::open(&path).expect("open");
        let mut follower = Follower::new(file, path.clone(), registry, Duration::from_millis(5));
        let mut out = Vec::new();
        follower.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"all\n");

        // Data appended after the end is not picked up again.
        writer.write_all(b"late\n").expect("write");
        let mut buf = [0u8; 16];
        assert_eq!(follower.read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn no_follower_for_other_or_absent_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::new());
        let job = Job::new("abc", "pkg", "test");
        assert!(open_follower(&registry, &job, FOLLOW_POLL).expect("open").is_none());

        let (registry, _job, _path, _writer) = running_job(dir.path());
        let other = Job::new("abc", "pkg", "vet");
        assert!(open_follower(&registry, &other, FOLLOW_POLL).expect("open").is_none());
    }

    #[test]
    fn live_request_streams_output_to_farmer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (registry, job, path, mut writer) = running_job(dir.path());
        writer.write_all(b"hello live\n").expect("write");

        let farmer = Arc::new(ScriptedFarmer::new());
        farmer.push_live_request(job.clone());
        let server = LiveServer {
            farmer: farmer.clone(),
            registry: registry.clone(),
            box_id: "box1".to_string(),
            poll: Duration::from_millis(5),
            error_backoff: Duration::from_millis(1),
            dispatch_delay: Duration::from_millis(1),
        };
        let session = server.poll_once().expect("poll").expect("session");
        thread::sleep(Duration::from_millis(20));
        registry.clear(&path);
        session.join().expect("join");

        let sent = farmer.live_sends();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, job);
        assert_eq!(sent[0].1, b"hello live\n");
    }

    #[test]
    fn empty_live_poll_starts_nothing() {
        let farmer = Arc::new(ScriptedFarmer::new());
        farmer.push_live_request(Job::default());
        let server = LiveServer {
            farmer: farmer.clone(),
            registry: Arc::new(Registry::new()),
            box_id: "box1".to_string(),
            poll: FOLLOW_POLL,
            error_backoff: Duration::from_millis(1),
            dispatch_delay: Duration::from_millis(1),
        };
        assert!(server.poll_once().expect("poll").is_none());
    }

    #[test]
    fn request_for_finished_job_is_dropped() {
        let farmer = Arc::new(ScriptedFarmer::new());
        let server = LiveServer {
            farmer: farmer.clone(),
            registry: Arc::new(Registry::new()),
            box_id: "box1".to_string(),
            poll: FOLLOW_POLL,
            error_backoff: Duration::from_millis(1),
            dispatch_delay: Duration::from_millis(1),
        };
        server.send_output(&Job::new("abc", "", "test"));
        assert!(farmer.live_sends().is_empty());
    }
}
