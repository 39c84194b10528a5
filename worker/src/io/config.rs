//! Worker configuration.
//!
//! Settings come from an optional TOML file, then from the environment
//! variables the fleet's provisioning sets (`FARMER_URL`, `GITHUB_ORG`, ...).
//! Missing fields default to the production values.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Worker configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base URL of the farmer service.
    pub farmer_url: String,

    /// GitHub organization and repository whose commits are tested.
    pub github_org: String,
    pub github_repo: String,

    /// Checkout directory name under `<ws>/src`. Defaults to the repo name.
    pub dirname: Option<String>,

    /// Working root. Wiped and recreated on `run`. Defaults to `$HOME/worker`.
    pub root_dir: Option<PathBuf>,

    /// Extra binaries made available to jobs. Defaults to `$HOME/bin`.
    pub bin_dir: Option<PathBuf>,

    /// Token handed to jobs as `NETLIFY_AUTH_TOKEN`.
    pub netlify_auth_token: String,

    /// Wall-clock budget for one job (checkout + setup + test).
    pub job_timeout_secs: u64,

    pub heartbeat_interval_ms: u64,
    /// Backoff after a failed state long poll.
    pub state_retry_ms: u64,
    /// Delay before the single fetch retry.
    pub fetch_retry_ms: u64,
    /// Backoff after a failed live-output long poll.
    pub live_error_backoff_ms: u64,
    /// Head start given to a follow session before polling again.
    pub live_dispatch_delay_ms: u64,
    /// How often a follower re-reads an output file it has caught up with.
    pub follow_poll_ms: u64,

    /// Timeout for ordinary farmer requests.
    pub request_timeout_secs: u64,
    /// Attempts for each status post before giving up.
    pub status_attempts: u32,
    pub status_retry_ms: u64,

    pub artifacts: ArtifactConfig,

    /// Trace correlation URL; `{trace_id}` and `{span_id}` are substituted.
    pub trace_url_template: String,
}

/// Where completed job output is stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Store outputs in this directory. Defaults to `<root>/artifacts`.
    pub dir: Option<PathBuf>,
    /// Base URL for stored outputs. With `dir` set, this is only used to
    /// build the reported URL; without it, outputs are uploaded here with
    /// HTTP PUT.
    pub base_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            farmer_url: "https://testbot.seqint.com".to_string(),
            github_org: "wepogo".to_string(),
            github_repo: "pogo".to_string(),
            dirname: None,
            root_dir: None,
            bin_dir: None,
            netlify_auth_token: String::new(),
            job_timeout_secs: 3 * 60,
            heartbeat_interval_ms: 1000,
            state_retry_ms: 1000,
            fetch_retry_ms: 2000,
            live_error_backoff_ms: 500,
            live_dispatch_delay_ms: 50,
            follow_poll_ms: 100,
            request_timeout_secs: 30,
            status_attempts: 3,
            status_retry_ms: 1000,
            artifacts: ArtifactConfig::default(),
            trace_url_template: "https://app.datadoghq.com/apm/trace/{trace_id}?spanID={span_id}"
                .to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.farmer_url.trim().is_empty() {
            return Err(anyhow!("farmer_url must be set"));
        }
        if self.github_org.trim().is_empty() || self.github_repo.trim().is_empty() {
            return Err(anyhow!("github_org and github_repo must be set"));
        }
        if self.job_timeout_secs == 0 {
            return Err(anyhow!("job_timeout_secs must be > 0"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(anyhow!("heartbeat_interval_ms must be > 0"));
        }
        if self.follow_poll_ms == 0 {
            return Err(anyhow!("follow_poll_ms must be > 0"));
        }
        if self.status_attempts == 0 {
            return Err(anyhow!("status_attempts must be > 0"));
        }
        Ok(())
    }

    /// Apply environment overrides using `lookup` (usually `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = get("FARMER_URL") {
            self.farmer_url = v;
        }
        if let Some(v) = get("GITHUB_ORG") {
            self.github_org = v;
        }
        if let Some(v) = get("GITHUB_REPO") {
            self.github_repo = v;
        }
        if let Some(v) = get("DIRNAME") {
            self.dirname = Some(v);
        }
        if let Some(v) = get("NETLIFY_AUTH_TOKEN") {
            self.netlify_auth_token = v;
        }
        if let Some(v) = get("ARTIFACT_DIR") {
            self.artifacts.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ARTIFACT_URL") {
            self.artifacts.base_url = Some(v);
        }
        if let Some(v) = get("TRACE_URL_TEMPLATE") {
            self.trace_url_template = v;
        }
    }

    pub fn repo_url(&self) -> String {
        format!(
            "https://github.com/{}/{}.git",
            self.github_org, self.github_repo
        )
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn state_retry(&self) -> Duration {
        Duration::from_millis(self.state_retry_ms)
    }

    pub fn fetch_retry(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_ms)
    }

    pub fn live_error_backoff(&self) -> Duration {
        Duration::from_millis(self.live_error_backoff_ms)
    }

    pub fn live_dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.live_dispatch_delay_ms)
    }

    pub fn follow_poll(&self) -> Duration {
        Duration::from_millis(self.follow_poll_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn status_retry(&self) -> Duration {
        Duration::from_millis(self.status_retry_ms)
    }

    /// Resolve the directory layout against `home`.
    pub fn layout(&self, home: &Path) -> Layout {
        let root_dir = self
            .root_dir
            .clone()
            .unwrap_or_else(|| home.join("worker"));
        let bin_dir = self.bin_dir.clone().unwrap_or_else(|| home.join("bin"));
        let ws_dir = root_dir.join("ws");
        let dirname = self.dirname.as_deref().unwrap_or(&self.github_repo);
        Layout {
            repo_dir: ws_dir.join("src").join(dirname),
            out_dir: root_dir.join("out"),
            artifact_dir: self
                .artifacts
                .dir
                .clone()
                .unwrap_or_else(|| root_dir.join("artifacts")),
            ws_dir,
            bin_dir,
            root_dir,
        }
    }
}

/// Resolved filesystem layout for one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub ws_dir: PathBuf,
    pub out_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub artifact_dir: PathBuf,
}

/// Load config from a TOML file (missing file means defaults), then apply
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    let mut cfg = match path {
        Some(path) if path.exists() => {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
        }
        _ => WorkerConfig::default(),
    };
    cfg.apply_env(|key| env::var(key).ok());
    cfg.validate()?;
    Ok(cfg)
}

/// `$HOME`, required to resolve the default layout.
pub fn home_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HOME is not set"))
}
