//! CLI tests for `testbot-worker one-job`.
//!
//! Spawns the worker binary against a checkout laid out the way `run` would
//! leave it and checks output and exit codes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use worker::exit_codes;
use worker::test_support::TestRepo;

struct Home {
    _home: tempfile::TempDir,
    config: PathBuf,
    home: PathBuf,
}

/// A home directory whose configured checkout is a clone of `repo`'s origin.
fn layout_for(repo: &TestRepo) -> Home {
    let home = tempfile::tempdir().expect("tempdir");
    let root = home.path().join("worker");
    let checkout = root.join("ws").join("src").join("repo");
    fs::create_dir_all(checkout.parent().expect("parent")).expect("mkdir");
    let status = Command::new("git")
        .arg("clone")
        .arg("--quiet")
        .arg(repo.origin())
        .arg(&checkout)
        .status()
        .expect("git clone");
    assert!(status.success());

    let config = home.path().join("worker.toml");
    fs::write(
        &config,
        format!(
            "root_dir = {:?}\ndirname = \"repo\"\njob_timeout_secs = 60\n",
            root.display().to_string()
        ),
    )
    .expect("write config");
    Home {
        home: home.path().to_path_buf(),
        _home: home,
        config,
    }
}

fn one_job(layout: &Home, sha: &str, dir: &str, name: &str) -> Output {
    worker_cmd(&layout.home, &layout.config)
        .args(["one-job", "--sha", sha, "--dir", dir, "--name", name])
        .output()
        .expect("run worker")
}

fn worker_cmd(home: &Path, config: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_testbot-worker"));
    cmd.env("HOME", home)
        .env_remove("DIRNAME")
        .env_remove("GITHUB_REPO")
        .env_remove("GITHUB_ORG")
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn passing_job_prints_output_and_exits_ok() {
    let repo = TestRepo::new().expect("repo");
    let sha = repo
        .commit_remote_files(
            &[("tools/Testfile", "test: echo from-one-job\n")],
            "add testfile",
        )
        .expect("commit");
    let layout = layout_for(&repo);

    let out = one_job(&layout, &sha, "tools", "test");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(out.status.code(), Some(exit_codes::OK), "{stdout}");
    assert!(stdout.contains("starting job"), "{stdout}");
    assert!(stdout.contains("from-one-job"), "{stdout}");
}

#[test]
fn failing_job_exits_with_job_failed() {
    let repo = TestRepo::new().expect("repo");
    let sha = repo
        .commit_remote("Testfile", "test: exit 9\n", "add failing testfile")
        .expect("commit");
    let layout = layout_for(&repo);

    let out = one_job(&layout, &sha, "", "test");
    assert_eq!(out.status.code(), Some(exit_codes::JOB_FAILED));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("exit status: 9"), "{stderr}");
}

#[test]
fn missing_entry_exits_with_job_failed() {
    let repo = TestRepo::new().expect("repo");
    let sha = repo
        .commit_remote("Testfile", "test: true\n", "add testfile")
        .expect("commit");
    let layout = layout_for(&repo);

    let out = one_job(&layout, &sha, "", "lint");
    assert_eq!(out.status.code(), Some(exit_codes::JOB_FAILED));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("cannot find Testfile entry lint"), "{stdout}");
}

#[test]
fn invalid_config_exits_fatal() {
    let repo = TestRepo::new().expect("repo");
    let sha = repo
        .commit_remote("Testfile", "test: true\n", "add testfile")
        .expect("commit");
    let layout = layout_for(&repo);
    fs::write(&layout.config, "job_timeout_secs = 0\n").expect("write config");

    let out = one_job(&layout, &sha, "", "test");
    assert_eq!(out.status.code(), Some(exit_codes::FATAL));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("job_timeout_secs must be > 0"), "{stderr}");
}

#[test]
fn missing_home_exits_fatal() {
    let repo = TestRepo::new().expect("repo");
    let sha = repo
        .commit_remote("Testfile", "test: true\n", "add testfile")
        .expect("commit");
    let layout = layout_for(&repo);

    let out = worker_cmd(&layout.home, &layout.config)
        .env_remove("HOME")
        .args(["one-job", "--sha", &sha, "--name", "test"])
        .output()
        .expect("run worker");
    assert_eq!(out.status.code(), Some(exit_codes::FATAL));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("HOME is not set"), "{stderr}");
}
