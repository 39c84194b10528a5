//! Deterministic naming for per-job output files.
//!
//! A job's directory may contain `/`, so it is escaped the way RFC 6901 (JSON
//! Pointer) escapes reference tokens: `~` becomes `~0` and `/` becomes `~1`.
//! The result is always a single path component.

use crate::core::types::Job;

/// Suffix shared by every output file.
pub const OUTPUT_EXT: &str = "output";

/// Escape a job directory into a single path component.
pub fn escape_dir(dir: &str) -> String {
    dir.replace('~', "~0").replace('/', "~1")
}

/// Reverse [`escape_dir`]. Unknown escapes are kept verbatim.
pub fn unescape_dir(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('0') => {
                chars.next();
                out.push('~');
            }
            Some('1') => {
                chars.next();
                out.push('/');
            }
            _ => out.push('~'),
        }
    }
    out
}

/// File name for one attempt of `job`: `SHA-dir-name.<suffix>.output`.
pub fn output_file_name(job: &Job, suffix: &str) -> String {
    format!(
        "{}-{}-{}.{suffix}.{OUTPUT_EXT}",
        job.sha,
        escape_dir(&job.dir),
        job.name
    )
}
