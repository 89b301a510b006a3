//! Task executor
//!
//! Performs the HTTP GET a job's payload points at and turns the outcome
//! into a [`DispatchRecord`] for the log.
//!
//! Design decisions:
//! - Non-2xx responses are outcomes, not errors; they are logged at warn level
//! - No request timeout unless one is configured; a hanging fetch holds its
//!   admission token until it completes
//! - Only a bounded preview of the body is kept for logging

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use bns_broker::JobId;

/// Default number of body characters kept in a dispatch record
pub const DEFAULT_PREVIEW_CHARS: usize = 256;

/// Executor errors
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The HTTP client could not be built
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request failed before a complete response was read
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Any other executor failure
    #[error("{0}")]
    Failed(String),
}

/// A completed HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub latency: Duration,
    pub body: Vec<u8>,
}

/// Performs one fetch per dispatched job
///
/// Implementations must not touch the broker; a failure is only ever logged.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

/// HTTP executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpExecutorConfig {
    /// Whole-request timeout (None = wait indefinitely)
    #[serde(with = "crate::duration_millis::option")]
    pub timeout: Option<Duration>,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for HttpExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: format!("bns/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every request to `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// [`TaskExecutor`] backed by a shared reqwest client
pub struct HttpExecutor {
    http: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(config: HttpExecutorConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(FetchError::Client)?;

        Ok(Self { http })
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let start = Instant::now();
        let response = self.http.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        Ok(FetchResponse {
            status,
            latency: start.elapsed(),
            body: body.to_vec(),
        })
    }
}

/// Result of one dispatched fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Response { status_code: u16, body_preview: String },
    Failed { error: String },
}

/// Log-only record of a dispatched job, discarded after it is emitted
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub latency: Duration,
    pub outcome: DispatchOutcome,
}

impl DispatchRecord {
    /// Run `executor` against `url` and record what happened
    pub async fn capture(executor: &dyn TaskExecutor, url: &str, preview_chars: usize) -> Self {
        let started_at = Utc::now();
        let start = Instant::now();

        let (latency, outcome) = match executor.fetch(url).await {
            Ok(response) => (
                response.latency,
                DispatchOutcome::Response {
                    status_code: response.status,
                    body_preview: body_preview(&response.body, preview_chars),
                },
            ),
            Err(e) => (
                start.elapsed(),
                DispatchOutcome::Failed {
                    error: e.to_string(),
                },
            ),
        };

        Self {
            url: url.to_string(),
            started_at,
            latency,
            outcome,
        }
    }

    /// Whether the fetch produced a 2xx response
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            DispatchOutcome::Response { status_code, .. } if (200..300).contains(&status_code)
        )
    }

    /// Emit the record as a single log event
    pub fn log(&self, job_id: JobId) {
        let latency_ms = self.latency.as_millis() as u64;
        let started_at = self.started_at.to_rfc3339();
        match &self.outcome {
            DispatchOutcome::Response {
                status_code,
                body_preview,
            } if self.is_success() => info!(
                %job_id,
                status = status_code,
                latency_ms,
                %started_at,
                url = %self.url,
                body = %body_preview,
                "Fetched"
            ),
            DispatchOutcome::Response {
                status_code,
                body_preview,
            } => warn!(
                %job_id,
                status = status_code,
                latency_ms,
                %started_at,
                url = %self.url,
                body = %body_preview,
                "Fetched with non-success status"
            ),
            DispatchOutcome::Failed { error } => warn!(
                %job_id,
                latency_ms,
                %started_at,
                url = %self.url,
                %error,
                "Fetch failed"
            ),
        }
    }
}

/// Lossy UTF-8 view of `body`, cut to `max_chars` characters
fn body_preview(body: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= max_chars {
        return text.into_owned();
    }
    let mut preview: String = text.chars().take(max_chars).collect();
    preview.push_str("...");
    preview
}
