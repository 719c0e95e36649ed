//! A client for the cluster manager's version 2 HTTP API.
//!
//! The rest of the crate talks to the cluster manager only through the [Api] trait. The
//! production implementation is [ClusterClient]; tests substitute an in-memory fake.
//!
//! # Jobs
//!
//! Some endpoints don't answer directly. They return a job ID, and the caller polls the job until
//! it finishes. [poll_job] does this, waiting between polls according to a [Backoff].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Job states that mean the job hasn't finished yet.
const PENDING_STATES: [&str; 3] = ["queued", "waiting", "running"];

/// Errors returned by [Api] implementations and the helpers built on them.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    /// The request never produced a response, e.g. the connection was refused or TLS failed.
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The cluster manager answered with a non-2xx status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The response body was not the JSON we expected.
    #[error("unexpected response from {path}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The cluster manager has no instance by this name.
    #[error("no such instance: {0}")]
    NotFound(String),

    /// The job was still pending when the polling budget ran out.
    #[error("job {job_id} was still {last_status} after {attempts} polls")]
    Timeout {
        job_id: String,
        attempts: u32,
        last_status: String,
    },
}

/// Authenticated, read-only access to the cluster manager.
#[async_trait]
pub trait Api {
    /// Performs a GET request for `path`, relative to the API base URL, and returns the body.
    ///
    /// `path` starts with a slash, e.g. `/instances`.
    async fn get(&self, path: &str) -> Result<Vec<u8>, ApiError>;
}

/// Fetches `path` and decodes the body as JSON.
pub async fn get_json<T, A>(api: &A, path: &str) -> Result<T, ApiError>
where
    T: DeserializeOwned,
    A: Api + ?Sized,
{
    let body = api.get(path).await?;
    serde_json::from_slice(&body).map_err(|source| ApiError::Decode {
        path: path.to_owned(),
        source,
    })
}

/// The production [Api] implementation, backed by [reqwest].
///
/// The cluster manager presents a certificate signed by a private CA, so certificate validation
/// is turned off. Proxy settings from the environment are ignored; the cluster manager is always
/// reached directly.
#[derive(Clone, Debug)]
pub struct ClusterClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl ClusterClient {
    /// Creates a client for the cluster manager at `host` (which may include a port).
    pub fn new(host: &str, user: &str, password: &str) -> Result<Self, ApiError> {
        Self::with_base_url(format!("https://{host}/2"), user, password)
    }

    /// Creates a client for an arbitrary base URL, e.g. a plain HTTP endpoint.
    pub fn with_base_url(
        base_url: impl Into<String>,
        user: &str,
        password: &str,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()
            .map_err(ApiError::Client)?;
        Ok(ClusterClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
        })
    }

    /// The full URL for an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl Api for ClusterClient {
    async fn get(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.url(path);
        debug!(%url, "GET");

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| ApiError::Transport { url, source })?;
        Ok(body.to_vec())
    }
}

/// How long [poll_job] waits between polls, and how many times it polls.
///
/// The wait doubles after every poll, starting at `initial`, and never exceeds `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            attempts: 10,
        }
    }
}

impl Backoff {
    /// A backoff that never sleeps. Useful in tests.
    pub fn immediate(attempts: u32) -> Self {
        Backoff {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            attempts,
        }
    }

    /// The wait after the zero-based poll `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }
}

/// A job ID as returned by the cluster manager, which may encode it as a number or a string.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum JobId {
    Number(u64),
    Text(String),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Number(n) => write!(f, "{n}"),
            JobId::Text(s) => f.write_str(s),
        }
    }
}

/// The subset of a job status resource that we use.
#[derive(Debug, Deserialize)]
struct JobStatus {
    status: String,
    #[serde(default)]
    opresult: Value,
}

/// The result of a finished job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobResult {
    /// The first opcode result was keyed by node (or instance) name; this is the entry for the
    /// name the caller asked about.
    PerNode(Value),

    /// The first opcode result, as-is.
    Scalar(Value),

    /// The job produced nothing of interest.
    Empty,
}

impl JobResult {
    /// Classifies a job's `opresult` field. `node` selects a per-node entry, if present.
    pub fn from_opresult(opresult: &Value, node: Option<&str>) -> Self {
        let first = match opresult.get(0) {
            Some(first) => first,
            None => return JobResult::Empty,
        };

        if let (Value::Object(map), Some(node)) = (first, node) {
            if let Some(entry) = map.get(node) {
                return JobResult::PerNode(entry.clone());
            }
        }

        if is_truthy(first) {
            JobResult::Scalar(first.clone())
        } else {
            JobResult::Empty
        }
    }

    /// Renders the result as JSON indented by one space per level, or an empty string for
    /// [JobResult::Empty].
    pub fn render(&self) -> String {
        let value = match self {
            JobResult::PerNode(value) | JobResult::Scalar(value) => value,
            JobResult::Empty => return String::new(),
        };

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        // A Value always has string keys, so serializing it can't fail.
        match value.serialize(&mut serializer) {
            Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => value.to_string(),
        }
    }
}

/// Whether a JSON value counts as "something" rather than an empty placeholder.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Polls a job until it leaves the queued, waiting, and running states.
///
/// # Returns
///
/// The job's result, classified by [JobResult::from_opresult] using `node`.
///
/// # Errors
///
/// Any error from the underlying requests is returned immediately; polling does not retry failed
/// requests. If the job is still pending after [Backoff::attempts] polls, returns
/// [ApiError::Timeout].
pub async fn poll_job<A: Api + ?Sized>(
    api: &A,
    job_id: &JobId,
    node: Option<&str>,
    backoff: &Backoff,
) -> Result<JobResult, ApiError> {
    let path = format!("/jobs/{job_id}");
    let mut last_status = String::from("unpolled");

    for attempt in 0..backoff.attempts {
        let job: JobStatus = get_json(api, &path).await?;
        debug!(job = %job_id, attempt, status = %job.status, "polled job");

        if !PENDING_STATES.contains(&job.status.as_str()) {
            return Ok(JobResult::from_opresult(&job.opresult, node));
        }
        last_status = job.status;

        // Don't sleep after the final poll; there's nothing left to wait for.
        if attempt + 1 < backoff.attempts {
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    }

    Err(ApiError::Timeout {
        job_id: job_id.to_string(),
        attempts: backoff.attempts,
        last_status,
    })
}


#[cfg(test)]
mod test;
