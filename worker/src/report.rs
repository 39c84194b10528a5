//! Reporting job results to the farmer.
//!
//! A job's terminal report appends the outcome to its output file, adds the
//! first diagnostic-looking line to the description, uploads the output, and
//! posts the status. [`Reporter::finish`] consumes the output file, so it
//! runs at most once per job and the file is closed exactly once.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::scan::{scan_error, strip_paths};
use crate::core::types::{BoxJobUpdateReq, Job, Outcome, Status};
use crate::io::artifacts::{ArtifactStore, upload_file};
use crate::io::farmer::Farmer;
use crate::io::trace::TraceSpan;
use crate::registry::Registry;

/// How status posts are retried.
#[derive(Debug, Clone, Copy)]
pub struct StatusRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for StatusRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// An open output file together with its registered path.
#[derive(Debug)]
pub struct JobOutput {
    pub file: File,
    pub path: PathBuf,
}

impl JobOutput {
    /// Create `path` for reading and writing. Fails if it already exists.
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        Ok(Self { file, path })
    }

    /// File name used when storing the output.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Posts statuses for one job.
pub struct Reporter {
    pub farmer: Arc<dyn Farmer>,
    pub store: Arc<dyn ArtifactStore>,
    pub registry: Arc<Registry>,
    pub job: Job,
    pub span: TraceSpan,
    pub start: Instant,
    pub trace_url_template: String,
    pub retry: StatusRetry,
}

impl Reporter {
    /// Post a status. Non-pending statuses carry the elapsed time and a trace
    /// URL. Failed posts are retried, then logged and dropped.
    pub fn post_status(&self, status: Status, desc: &str, url: &str) {
        let terminal = status != Status::Pending;
        let req = BoxJobUpdateReq {
            job: self.job.clone(),
            status,
            desc: desc.to_string(),
            url: url.to_string(),
            elapsed: terminal.then(|| self.start.elapsed()),
            trace_url: terminal.then(|| self.span.url(&self.trace_url_template)),
        };
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.farmer.post_status(&req) {
                Ok(()) => return,
                Err(err) if attempt < attempts => {
                    warn!(job = %self.job, attempt, err = %format!("{err:#}"), "status post failed, retrying");
                    thread::sleep(self.retry.delay);
                }
                Err(err) => {
                    warn!(job = %self.job, %status, err = %format!("{err:#}"), "giving up on status post");
                }
            }
        }
    }

    /// Report the job's terminal outcome, close its output, and release the
    /// registry.
    ///
    /// If the upload fails the farmer is told about the upload error instead
    /// of the job outcome.
    pub fn finish(&self, output: JobOutput, outcome: Outcome, job_dir: &Path, repo_dir: &Path) {
        let name = output.name();
        let JobOutput { mut file, path } = output;
        let Outcome { status, mut desc } = outcome;
        info!(job = %self.job, %status, %desc, "job finished");

        if let Err(err) = writeln!(file, "{desc}") {
            warn!(err = %err, "failed to append outcome to output");
        }
        if status != Status::Success
            && let Some(line) = diagnostic(&mut file)
        {
            let line = strip_paths(
                &line,
                &job_dir.display().to_string(),
                &repo_dir.display().to_string(),
            );
            desc = format!("{desc}: {line}");
        }

        match upload_file(self.store.as_ref(), &name, &mut file) {
            Ok(url) => self.post_status(status, &desc, &url),
            Err(err) => {
                warn!(job = %self.job, err = %format!("{err:#}"), "cannot upload output file");
                self.post_status(Status::Error, &format!("artifact upload: {err:#}"), "");
            }
        }

        drop(file);
        self.registry.clear(&path);
    }
}

/// First error-looking line of `file`, read from the start.
fn diagnostic(file: &mut File) -> Option<String> {
    if let Err(err) = file.seek(SeekFrom::Start(0)) {
        warn!(err = %err, "failed to rewind output for scanning");
        return None;
    }
    scan_error(BufReader::new(&*file))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::{FailingStore, MemoryStore, ScriptedFarmer};

    struct Fixture {
        _dir: tempfile::TempDir,
        farmer: Arc<ScriptedFarmer>,
        store: Arc<MemoryStore>,
        registry: Arc<Registry>,
        reporter: Reporter,
        output: JobOutput,
    }

    fn fixture(store: Arc<dyn ArtifactStore>, memory: Arc<MemoryStore>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let farmer = Arc::new(ScriptedFarmer::new());
        let registry = Arc::new(Registry::new());
        let job = Job::new("abc", "svc", "test");
        let output = JobOutput::create(dir.path().join("abc-svc-test.x.output")).expect("create");
        registry.set(&job, &output.path).expect("register");
        let reporter = Reporter {
            farmer: farmer.clone(),
            store,
            registry: registry.clone(),
            job,
            span: TraceSpan {
                trace_id: 1,
                span_id: 2,
            },
            start: Instant::now(),
            trace_url_template: "https://trace/{trace_id}/{span_id}".to_string(),
            retry: StatusRetry {
                attempts: 2,
                delay: Duration::from_millis(1),
            },
        };
        Fixture {
            _dir: dir,
            farmer,
            store: memory,
            registry,
            reporter,
            output,
        }
    }

    fn memory_fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        fixture(store.clone(), store)
    }

    #[test]
    fn failure_appends_stripped_diagnostic() {
        let mut fx = memory_fixture();
        writeln!(fx.output.file, "go test ./...").expect("write");
        writeln!(fx.output.file, "/repo/svc/foo.go:42: undefined: bar").expect("write");
        let path = fx.output.path.clone();

        fx.reporter.finish(
            fx.output,
            Outcome::failure("exit status: 1"),
            Path::new("/repo/svc"),
            Path::new("/repo"),
        );

        let posted = fx.farmer.statuses();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].status, Status::Failure);
        assert_eq!(posted[0].desc, "exit status: 1: foo.go:42: undefined: bar");
        assert_eq!(posted[0].trace_url.as_deref(), Some("https://trace/1/2"));
        assert!(posted[0].elapsed.is_some());

        let stored = fx.store.get("abc-svc-test.x.output").expect("stored");
        assert!(stored.ends_with("exit status: 1\n"));
        assert_eq!(posted[0].url, "mem://abc-svc-test.x.output");
        assert!(fx.registry.current_job().is_empty());
        assert!(!fx.registry.is_current_output(&path));
    }

    #[test]
    fn success_keeps_description() {
        let mut fx = memory_fixture();
        writeln!(fx.output.file, "ERROR: looks bad but passed").expect("write");
        fx.reporter.finish(
            fx.output,
            Outcome::success("12ms"),
            Path::new("/repo/svc"),
            Path::new("/repo"),
        );
        let posted = fx.farmer.statuses();
        assert_eq!(posted[0].status, Status::Success);
        assert_eq!(posted[0].desc, "12ms");
    }

    #[test]
    fn upload_failure_overrides_outcome() {
        let memory = Arc::new(MemoryStore::new());
        let fx = fixture(Arc::new(FailingStore), memory);
        fx.reporter.finish(
            fx.output,
            Outcome::success("5ms"),
            Path::new("/repo"),
            Path::new("/repo"),
        );
        let posted = fx.farmer.statuses();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].status, Status::Error);
        assert!(posted[0].desc.starts_with("artifact upload:"), "{}", posted[0].desc);
        assert!(fx.registry.current_job().is_empty());
    }

    #[test]
    fn status_post_is_retried() {
        let fx = memory_fixture();
        fx.farmer.fail_next_status_posts(1);
        fx.reporter.post_status(Status::Pending, "running", "");
        let posted = fx.farmer.statuses();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].elapsed, None);
        assert_eq!(posted[0].trace_url, None);
        assert_eq!(fx.farmer.status_attempts(), 2);
    }

    #[test]
    fn output_file_is_created_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.output");
        let out = JobOutput::create(path.clone()).expect("create");
        assert_eq!(out.name(), "a.output");
        assert!(JobOutput::create(path.clone()).is_err());
        drop(out);
        assert!(fs::metadata(path).is_ok());
    }
}
