//! Heuristic extraction of a one-line diagnostic from build tool output.

use std::io::BufRead;

/// Placeholder substituted for the repository root in reported diagnostics.
pub const REPO_PLACEHOLDER: &str = "$I10R/";

/// Prefix used by TypeScript-style tools (tsc, tslint, ...).
const ERROR_PREFIX: &str = "ERROR: ";

/// True if `line` looks like a compiler error message.
///
/// Two shapes are recognized:
/// - `ERROR: anything`
/// - `path/to/file.ext:123: any text here`, unless the text is a warning.
pub fn looks_like_error(line: &str) -> bool {
    if line.starts_with(ERROR_PREFIX) {
        return true;
    }

    let Some((file, rest)) = line.split_once(':') else {
        return false;
    };
    let Some(colon) = rest.find(':') else {
        return false;
    };
    if file.contains(' ') {
        return false;
    }
    rest[..colon].parse::<i64>().is_ok() && !rest[colon..].contains("warning:")
}

/// Return the first line of `reader` that [`looks_like_error`], trimmed.
///
/// Lines that are not valid UTF-8 are decoded lossily. Read errors end the
/// scan as if the input ended there.
pub fn scan_error<R: BufRead>(mut reader: R) -> Option<String> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if looks_like_error(line) {
            return Some(line.to_string());
        }
    }
}

/// Shorten absolute paths in a diagnostic line.
///
/// Paths under the job directory become relative to it; other paths under
/// the repository root are rewritten to start with [`REPO_PLACEHOLDER`].
pub fn strip_paths(line: &str, job_dir: &str, repo_dir: &str) -> String {
    let job_prefix = format!("{}/", job_dir.trim_end_matches('/'));
    let repo_prefix = format!("{}/", repo_dir.trim_end_matches('/'));
    line.replace(&job_prefix, "")
        .replace(&repo_prefix, REPO_PLACEHOLDER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_style_error_matches() {
        assert!(looks_like_error("pkg/foo.go:42: undefined: bar"));
        assert!(looks_like_error("main.c:7:12: error: expected ';'"));
    }

    #[test]
    fn warnings_do_not_match() {
        assert!(!looks_like_error("pkg/foo.go:42: warning: unused"));
        assert!(!looks_like_error("main.c:7:12: warning: unused variable"));
    }

    #[test]
    fn error_prefix_matches() {
        assert!(looks_like_error("ERROR: build failed"));
    }

    #[test]
    fn plain_text_does_not_match() {
        assert!(!looks_like_error("just some text"));
        assert!(!looks_like_error(""));
        assert!(!looks_like_error("note: see here"));
        assert!(!looks_like_error("ok  \tpkg/foo\t0.01s"));
    }

    #[test]
    fn file_token_with_space_does_not_match() {
        assert!(!looks_like_error("some file.go:12: oops"));
    }

    #[test]
    fn non_numeric_line_does_not_match() {
        assert!(!looks_like_error("foo.go:abc: oops"));
        assert!(!looks_like_error("http://example.com:8080"));
        assert!(!looks_like_error("Time: 12:30:00"));
    }

    #[test]
    fn scan_returns_first_match_trimmed() {
        let input = b"building\n  pkg/a.go:1: warning: x\n  pkg/b.go:2: bad thing  \npkg/c.go:3: other\n";
        assert_eq!(
            scan_error(&input[..]),
            Some("pkg/b.go:2: bad thing".to_string())
        );
    }

    #[test]
    fn scan_without_match_is_none() {
        assert_eq!(scan_error(&b"all good\nexit status 0\n"[..]), None);
        assert_eq!(scan_error(&b""[..]), None);
    }

    #[test]
    fn scan_handles_invalid_utf8() {
        let input = b"\xff\xfe junk\nERROR: build failed\n";
        assert_eq!(
            scan_error(&input[..]),
            Some("ERROR: build failed".to_string())
        );
    }

    #[test]
    fn strip_paths_relativizes_job_dir_and_masks_repo() {
        let line = "/w/src/pogo/svc/api/main.go:3: bad import /w/src/pogo/lib/x.go";
        assert_eq!(
            strip_paths(line, "/w/src/pogo/svc/api", "/w/src/pogo"),
            "main.go:3: bad import $I10R/lib/x.go"
        );
    }
}
