//! Shared wire and domain types exchanged with the farmer.
//!
//! Field names on the wire follow the farmer's JSON encoding (`SHA`, `Dir`,
//! `Name`, ...), so every struct renames its fields explicitly.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

/// One unit of work: a commit, the directory holding its Testfile, and the
/// Testfile entry to run.
///
/// The all-empty value is the "no job" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "SHA", default)]
    pub sha: String,
    #[serde(rename = "Dir", default)]
    pub dir: String,
    #[serde(rename = "Name", default)]
    pub name: String,
}

impl Job {
    pub fn new(sha: impl Into<String>, dir: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            dir: dir.into(),
            name: name.into(),
        }
    }

    /// True for the sentinel "no job" value.
    pub fn is_empty(&self) -> bool {
        self.sha.is_empty() && self.dir.is_empty() && self.name.is_empty()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} {} {}}}", self.sha, self.dir, self.name)
    }
}

/// The farmer's view of what a box should be doing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxState {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Job", default)]
    pub job: Job,
}

impl BoxState {
    /// Initial state for a box: its id and no job.
    pub fn idle(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job: Job::default(),
        }
    }
}

/// Heartbeat payload announcing a box to the farmer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxPingReq {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Host")]
    pub host: String,
}

/// Request body for the live-output long poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxLivePollReq {
    #[serde(rename = "ID")]
    pub id: String,
}

/// Status reported to the farmer for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Posted when a job starts; never terminal.
    Pending,
    Success,
    Failure,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one job attempt, before it is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: Status,
    pub desc: String,
}

impl Outcome {
    pub fn success(desc: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            desc: desc.into(),
        }
    }

    pub fn failure(desc: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            desc: desc.into(),
        }
    }

    pub fn error(desc: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            desc: desc.into(),
        }
    }
}

/// Status update posted to `/box-runstatus`.
///
/// `elapsed` and `trace_url` are only sent with non-pending statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoxJobUpdateReq {
    #[serde(rename = "Job")]
    pub job: Job,
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "Desc")]
    pub desc: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(
        rename = "Elapsed",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_nanos"
    )]
    pub elapsed: Option<Duration>,
    #[serde(rename = "TraceURL", skip_serializing_if = "Option::is_none")]
    pub trace_url: Option<String>,
}

/// Durations travel as integer nanoseconds.
fn serialize_nanos<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
        None => s.serialize_none(),
    }
}
