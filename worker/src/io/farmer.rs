//! Farmer (coordinator) protocol adapter.
//!
//! The [`Farmer`] trait decouples the worker loops from HTTP. Tests use a
//! scripted farmer that records calls without any network.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Body, Client, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::core::types::{BoxJobUpdateReq, BoxLivePollReq, BoxPingReq, BoxState, Job};

/// Calls a box makes to the farmer. Each call is one request and one response.
pub trait Farmer: Send + Sync {
    /// Announce that this box is alive.
    fn ping(&self, req: &BoxPingReq) -> Result<()>;

    /// Long-poll for the desired state, sending the last known one. Returns
    /// the last known state unchanged when the server times the poll out.
    fn long_poll(&self, state: &BoxState) -> Result<BoxState>;

    /// Long-poll for a request to stream a job's live output. The empty job
    /// means "no request".
    fn live_poll(&self, box_id: &str) -> Result<Job>;

    /// Stream `body` as the live output of `job`. Returns when the body is
    /// exhausted or the farmer hangs up.
    fn live_send(&self, box_id: &str, job: &Job, body: Box<dyn Read + Send>) -> Result<()>;

    /// Report a job status.
    fn post_status(&self, req: &BoxJobUpdateReq) -> Result<()>;
}

/// Farmer reached over HTTP with JSON bodies.
///
/// One client is shared for all requests so connection setup is amortized.
/// Live output uses a second client without a request timeout, since a
/// stream lasts as long as the job.
#[derive(Debug, Clone)]
pub struct HttpFarmer {
    base_url: String,
    client: Client,
    stream_client: Client,
}

impl HttpFarmer {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("build farmer http client")?;
        let stream_client = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("build farmer stream client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            stream_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .with_context(|| format!("POST {url}"))?;
        check_status(resp, &url)
    }

    fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let text = self
            .post(path, body)?
            .text()
            .with_context(|| format!("read response from {path}"))?;
        serde_json::from_str(&text)
            .with_context(|| format!("decode response from {path}: {}", text.trim()))
    }
}

fn check_status(resp: Response, url: &str) -> Result<Response> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().unwrap_or_default();
        bail!("POST {url}: {status}: {}", text.trim());
    }
    Ok(resp)
}

impl Farmer for HttpFarmer {
    fn ping(&self, req: &BoxPingReq) -> Result<()> {
        self.post("/box-ping", req)?;
        Ok(())
    }

    fn long_poll(&self, state: &BoxState) -> Result<BoxState> {
        self.post_json("/box-longpoll", state)
    }

    fn live_poll(&self, box_id: &str) -> Result<Job> {
        self.post_json(
            "/box-livepoll",
            &BoxLivePollReq {
                id: box_id.to_string(),
            },
        )
    }

    #[instrument(skip_all, fields(job = %job))]
    fn live_send(&self, box_id: &str, job: &Job, body: Box<dyn Read + Send>) -> Result<()> {
        let url = self.url("/box-livesend");
        debug!("streaming live output");
        let resp = self
            .stream_client
            .post(&url)
            .header("Box-ID", box_id)
            .header("Job-SHA", &job.sha)
            .header("Job-Dir", &job.dir)
            .header("Job-Name", &job.name)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Body::new(body))
            .send()
            .with_context(|| format!("POST {url}"))?;
        check_status(resp, &url)?;
        Ok(())
    }

    fn post_status(&self, req: &BoxJobUpdateReq) -> Result<()> {
        self.post("/box-runstatus", req)?;
        Ok(())
    }
}
