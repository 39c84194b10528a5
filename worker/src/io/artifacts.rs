//! Artifact stores for completed job output.
//!
//! A store takes the full contents of an output file and returns the URL the
//! farmer should link to.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use tracing::{debug, instrument};

/// Write-once storage for job output.
pub trait ArtifactStore: Send + Sync {
    /// Store everything readable from `body` under `name`; return its URL.
    fn put(&self, name: &str, body: &mut dyn Read) -> Result<String>;
}

/// Rewind `file` and store it.
pub fn upload_file(store: &dyn ArtifactStore, name: &str, file: &mut File) -> Result<String> {
    file.seek(SeekFrom::Start(0)).context("rewind output file")?;
    store.put(name, file)
}

/// Stores artifacts as files in a local directory.
///
/// URLs are `file://` paths unless a public base URL (for a directory served
/// by some other process) is configured.
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
    base_url: Option<String>,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }
}

impl ArtifactStore for DirStore {
    #[instrument(skip_all, fields(name))]
    fn put(&self, name: &str, body: &mut dyn Read) -> Result<String> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))?;
        let path = self.dir.join(name);
        let mut dest =
            File::create(&path).with_context(|| format!("create {}", path.display()))?;
        let n = std::io::copy(body, &mut dest)
            .with_context(|| format!("write {}", path.display()))?;
        debug!(bytes = n, path = %path.display(), "stored artifact");
        Ok(match &self.base_url {
            Some(base) => format!("{base}/{name}"),
            None => format!("file://{}", path.display()),
        })
    }
}

/// Uploads artifacts with `PUT <base>/<name>` to an HTTP object store.
#[derive(Debug, Clone)]
pub struct HttpStore {
    base_url: String,
    client: Client,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build artifact http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl ArtifactStore for HttpStore {
    #[instrument(skip_all, fields(name))]
    fn put(&self, name: &str, body: &mut dyn Read) -> Result<String> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).context("read artifact")?;
        let url = format!("{}/{name}", self.base_url);
        let resp = self
            .client
            .put(&url)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(buf)
            .send()
            .with_context(|| format!("PUT {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("PUT {url}: {status}");
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn dir_store_copies_and_returns_file_url() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(temp.path().join("artifacts"), None);
        let url = store.put("job.output", &mut &b"hello\n"[..]).expect("put");
        let path = temp.path().join("artifacts/job.output");
        assert_eq!(url, format!("file://{}", path.display()));
        assert_eq!(fs::read_to_string(path).expect("read"), "hello\n");
    }

    #[test]
    fn dir_store_uses_public_base_url() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(temp.path(), Some("https://logs.example/out/".to_string()));
        let url = store.put("a.output", &mut &b"x"[..]).expect("put");
        assert_eq!(url, "https://logs.example/out/a.output");
    }

    #[test]
    fn upload_file_rewinds_before_copying() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(b"line one\nline two\n").expect("write");
        let store = DirStore::new(temp.path(), None);
        upload_file(&store, "f.output", &mut file).expect("upload");
        assert_eq!(
            fs::read_to_string(temp.path().join("f.output")).expect("read"),
            "line one\nline two\n"
        );
    }
}
