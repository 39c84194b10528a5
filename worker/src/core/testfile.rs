//! Parser for per-directory `Testfile`s.
//!
//! A Testfile maps task names to shell commands, one per line:
//!
//! ```text
//! # comments and blank lines are ignored
//! setup: make deps
//! test: go test ./...
//! ```
//!
//! The `setup` entry is reserved: it runs before any job in or below its
//! directory and is never run as a test itself.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;

/// File name the executor looks for in every directory.
pub const TESTFILE_NAME: &str = "Testfile";

/// Reserved entry run before ordinary tasks.
pub const SETUP_TASK: &str = "setup";

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.-]+):\s*(.*?)\s*$").expect("valid testfile regex")
});

/// Parsed Testfile: task name to shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Testfile {
    entries: BTreeMap<String, String>,
}

impl Testfile {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// The `setup` command, if declared.
    pub fn setup(&self) -> Option<&str> {
        self.get(SETUP_TASK)
    }
}

/// Parse a Testfile. Errors name the offending 1-based line.
pub fn parse_testfile<R: BufRead>(reader: R) -> Result<Testfile> {
    let mut entries = BTreeMap::new();
    for (idx, line) in reader.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.with_context(|| format!("read line {lineno}"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(caps) = ENTRY_RE.captures(trimmed) else {
            bail!("line {lineno}: expected `name: command`, got {trimmed:?}");
        };
        let name = caps[1].to_string();
        let command = caps[2].to_string();
        if command.is_empty() {
            bail!("line {lineno}: entry {name:?} has an empty command");
        }
        if entries.contains_key(&name) {
            bail!("line {lineno}: duplicate entry {name:?}");
        }
        entries.insert(name, command);
    }
    Ok(Testfile { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_and_skips_comments() {
        let tf = parse_testfile(
            &b"# deps first\nsetup: make deps\n\ntest: go test ./...\nvet:   go vet ./...  \n"[..],
        )
        .expect("parse");
        assert_eq!(tf.setup(), Some("make deps"));
        assert_eq!(tf.get("test"), Some("go test ./..."));
        assert_eq!(tf.get("vet"), Some("go vet ./..."));
        assert_eq!(tf.get("lint"), None);
    }

    #[test]
    fn file_without_setup_has_none() {
        let tf = parse_testfile(&b"b: two\na: one\n"[..]).expect("parse");
        assert_eq!(tf.setup(), None);
        assert_eq!(tf.get("a"), Some("one"));
    }

    #[test]
    fn command_may_contain_colons() {
        let tf = parse_testfile(&b"run: echo a:b:c | tr : -\n"[..]).expect("parse");
        assert_eq!(tf.get("run"), Some("echo a:b:c | tr : -"));
    }

    #[test]
    fn rejects_malformed_line() {
        let err = parse_testfile(&b"test: ok\nnot an entry\n"[..]).expect_err("should fail");
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn rejects_empty_command() {
        let err = parse_testfile(&b"test:\n"[..]).expect_err("should fail");
        assert!(err.to_string().contains("empty command"), "{err}");
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = parse_testfile(&b"test: a\ntest: b\n"[..]).expect_err("should fail");
        assert!(err.to_string().contains("duplicate entry"), "{err}");
    }
}
