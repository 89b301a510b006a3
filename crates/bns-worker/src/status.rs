//! Tube and server status reports

use std::fmt;

use bns_broker::{Broker, BrokerError, Stats};
use serde::Serialize;

use crate::error::CallSite;

/// Status errors
#[derive(Debug, thiserror::Error)]
#[error("{site}: {operation} {tube}: {error}")]
pub struct StatusError {
    pub operation: &'static str,
    pub tube: String,
    pub site: CallSite,
    #[source]
    pub error: BrokerError,
}

/// Snapshot of one tube's statistics
///
/// The headline fields are copied out of `stats`; any the server did not
/// report are left empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TubeStatus {
    pub name: String,
    pub current_watching: String,
    pub current_jobs_ready: String,
    pub total_jobs: String,
    /// Every statistic the server returned
    pub stats: Stats,
}

impl TubeStatus {
    pub fn from_stats(tube: &str, stats: Stats) -> Self {
        let field = |key: &str| stats.get(key).cloned().unwrap_or_default();
        Self {
            name: stats.get("name").cloned().unwrap_or_else(|| tube.to_string()),
            current_watching: field("current-watching"),
            current_jobs_ready: field("current-jobs-ready"),
            total_jobs: field("total-jobs"),
            stats,
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TubeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tube name: {}, watching consumers: {}, jobs ready/total: {}/{}",
            self.name, self.current_watching, self.current_jobs_ready, self.total_jobs
        )
    }
}

/// Fetch the statistics of `tube`
pub async fn tube_status<B>(broker: &mut B, tube: &str) -> Result<TubeStatus, StatusError>
where
    B: Broker + ?Sized,
{
    let stats = broker
        .stats_tube(tube)
        .await
        .map_err(|error| StatusError {
            operation: "stats-tube",
            tube: tube.to_string(),
            site: CallSite::capture("tube_status"),
            error,
        })?;
    Ok(TubeStatus::from_stats(tube, stats))
}

/// One tube's status together with the server-wide view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub tube: TubeStatus,
    /// Every tube the server knows about
    pub tubes: Vec<String>,
    /// Server-wide statistics
    pub server: Stats,
}

/// Fetch the statistics of `tube`, the tube list and the server statistics
pub async fn server_status<B>(broker: &mut B, tube: &str) -> Result<ServerStatus, StatusError>
where
    B: Broker + ?Sized,
{
    let status = tube_status(broker, tube).await?;
    let failed = |operation: &'static str, error: BrokerError| StatusError {
        operation,
        tube: tube.to_string(),
        site: CallSite::capture("server_status"),
        error,
    };
    let tubes = broker
        .list_tubes()
        .await
        .map_err(|e| failed("list-tubes", e))?;
    let server = broker.stats().await.map_err(|e| failed("stats", e))?;

    Ok(ServerStatus {
        tube: status,
        tubes,
        server,
    })
}
