//! Initialization helpers: box identity and the worker's filesystem layout.

use std::fs;
use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::io::config::Layout;
use crate::io::git::Git;
use crate::io::process::JobControl;

/// Budget for the initial clone.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Branch the checkout sits on, so hard resets never move a shared branch.
const WORK_BRANCH: &str = "t";

/// 20 hex characters from 10 random bytes.
pub fn random_id() -> String {
    hex::encode(rand::random::<[u8; 10]>())
}

/// This machine's hostname, or an empty string if it cannot be read.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Start from a clean slate: wipe the root, recreate the workspace and
/// output directories, and clone the repository.
///
/// Clone output goes to stdout.
pub fn bootstrap(layout: &Layout, repo_url: &str) -> Result<Git> {
    info!(root = %layout.root_dir.display(), "initializing filesystem");
    match fs::remove_dir_all(&layout.root_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("remove {}", layout.root_dir.display()));
        }
    }
    for dir in [&layout.ws_dir, &layout.out_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if let Some(parent) = layout.repo_dir.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }

    let ctl = JobControl::new(BOOTSTRAP_TIMEOUT);
    let mut out = io::stdout();
    let git = Git::clone_from(repo_url, &layout.repo_dir, &mut out, &ctl)?;
    git.checkout_new_branch(&mut out, &ctl, WORK_BRANCH)?;
    Ok(git)
}
