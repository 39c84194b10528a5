//! Registry of the job this box is currently running.
//!
//! The job executor writes it, the live follower reads it. The lock is held
//! only to read or write the two fields, never across I/O, so readers must not
//! assume the named file still exists (or is still being written) by the time
//! they use the path.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use tracing::debug;

use crate::core::types::Job;

#[derive(Debug, Default)]
struct Current {
    job: Job,
    out: Option<PathBuf>,
}

/// At most one job at a time, with the path of its output file.
#[derive(Debug, Default)]
pub struct Registry {
    current: Mutex<Current>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `job` as running with output at `out`.
    ///
    /// Fails if another job is still registered.
    pub fn set(&self, job: &Job, out: &Path) -> Result<()> {
        let mut cur = self.lock();
        if let Some(existing) = &cur.out {
            bail!(
                "job {} is still running (output {})",
                cur.job,
                existing.display()
            );
        }
        debug!(%job, out = %out.display(), "registered current job");
        cur.job = job.clone();
        cur.out = Some(out.to_path_buf());
        Ok(())
    }

    /// Clear the registry if it still names `out`. Returns whether it did.
    pub fn clear(&self, out: &Path) -> bool {
        let mut cur = self.lock();
        if cur.out.as_deref() != Some(out) {
            return false;
        }
        debug!(job = %cur.job, "cleared current job");
        *cur = Current::default();
        true
    }

    /// The current job, or the empty job if none is running.
    pub fn current_job(&self) -> Job {
        self.lock().job.clone()
    }

    /// The output path of `job` if it is the one currently running.
    pub fn output_for(&self, job: &Job) -> Option<PathBuf> {
        let cur = self.lock();
        if job.is_empty() || cur.job != *job {
            return None;
        }
        cur.out.clone()
    }

    /// True while `path` is the current job's output file.
    pub fn is_current_output(&self, path: &Path) -> bool {
        self.lock().out.as_deref() == Some(path)
    }

    fn lock(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_output() {
        let reg = Registry::new();
        assert!(reg.current_job().is_empty());
        assert_eq!(reg.output_for(&Job::default()), None);
        assert_eq!(reg.output_for(&Job::new("a", "", "t")), None);
    }

    #[test]
    fn set_then_lookup_matches_exact_job() {
        let reg = Registry::new();
        let job = Job::new("abc", "pkg", "test");
        reg.set(&job, Path::new("/out/a")).expect("set");
        assert_eq!(reg.output_for(&job), Some(PathBuf::from("/out/a")));
        assert_eq!(reg.output_for(&Job::new("abc", "pkg", "vet")), None);
        assert!(reg.is_current_output(Path::new("/out/a")));
        assert!(!reg.is_current_output(Path::new("/out/b")));
    }

    #[test]
    fn second_job_is_refused_while_occupied() {
        let reg = Registry::new();
        reg.set(&Job::new("a", "", "t"), Path::new("/out/a"))
            .expect("set");
        let err = reg
            .set(&Job::new("b", "", "t"), Path::new("/out/b"))
            .expect_err("occupied");
        assert!(err.to_string().contains("still running"));
        assert_eq!(reg.current_job(), Job::new("a", "", "t"));
    }

    #[test]
    fn clear_only_matching_output() {
        let reg = Registry::new();
        reg.set(&Job::new("a", "", "t"), Path::new("/out/a"))
            .expect("set");
        assert!(!reg.clear(Path::new("/out/other")));
        assert!(reg.clear(Path::new("/out/a")));
        assert!(!reg.clear(Path::new("/out/a")));
        assert!(reg.current_job().is_empty());
        reg.set(&Job::new("b", "", "t"), Path::new("/out/b"))
            .expect("set after clear");
    }
}
