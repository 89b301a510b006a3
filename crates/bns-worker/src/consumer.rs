//! Consumption loop
//!
//! One sequential loop per broker connection:
//!
//! ```text
//! IDLE → RESERVING → VALIDATING → DISPATCHING → ACKNOWLEDGING → IDLE
//!            │            │             │
//!         timeout      malformed     acquire token (may wait)
//!         (retry)      (bury 99)     spawn fetch, then delete
//! ```
//!
//! The admission token is taken in the loop itself, so once every token is
//! out the loop stops reserving until an execution finishes. At most one
//! extra job is held while waiting.
//!
//! Jobs are deleted right after dispatch, before the fetch completes. A
//! failed fetch is logged and never reported back to the broker, so each
//! job gets at most one attempt from this consumer.

use std::sync::Arc;
use std::time::Duration;

use bns_broker::{Broker, BrokerError, Job, JobId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::error::CallSite;
use crate::executor::{DispatchRecord, TaskExecutor, DEFAULT_PREVIEW_CHARS};
use crate::gate::{AdmissionGate, GateError};

/// Default number of concurrent fetches
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Priority malformed jobs are buried with
pub const BURY_PRIORITY: u32 = 99;

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Identifier attached to every log line of this consumer
    pub consumer_id: String,

    /// Tube to consume from (the only watched tube)
    pub tube: String,

    /// Admission gate capacity
    pub concurrency: usize,

    /// Wait passed to each reservation
    #[serde(with = "crate::duration_millis")]
    pub reserve_timeout: Duration,

    /// Priority used when burying malformed jobs
    pub bury_priority: u32,

    /// Priority used when handing a held job back on shutdown
    pub release_priority: u32,

    /// How long shutdown waits for in-flight fetches
    #[serde(with = "crate::duration_millis")]
    pub shutdown_timeout: Duration,

    /// Body characters kept in each dispatch log record
    pub preview_chars: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: format!("consumer-{}", Uuid::now_v7()),
            tube: bns_broker::DEFAULT_TUBE.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            reserve_timeout: Duration::from_secs(5),
            bury_priority: BURY_PRIORITY,
            release_priority: 1,
            shutdown_timeout: Duration::from_secs(30),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

impl ConsumerConfig {
    /// Create a configuration consuming `tube`
    pub fn new(tube: impl Into<String>) -> Self {
        Self {
            tube: tube.into(),
            ..Default::default()
        }
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set the admission gate capacity
    pub fn with_concurrency(mut self, max: usize) -> Self {
        self.concurrency = max.max(1);
        self
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn with_bury_priority(mut self, priority: u32) -> Self {
        self.bury_priority = priority;
        self
    }

    pub fn with_release_priority(mut self, priority: u32) -> Self {
        self.release_priority = priority;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }
}

/// Consumer errors
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// A broker call the loop cannot continue without failed
    #[error("{site}: {operation}: {error}")]
    Broker {
        operation: &'static str,
        site: CallSite,
        error: BrokerError,
    },

    /// Admission gate error
    #[error("admission gate error: {0}")]
    Gate(#[from] GateError),

    /// In-flight fetches did not finish within the shutdown timeout
    #[error("graceful shutdown timed out with {outstanding} fetch(es) in flight")]
    ShutdownTimeout { outstanding: usize },
}

impl ConsumerError {
    #[track_caller]
    fn broker(operation: &'static str, function: &'static str, error: BrokerError) -> Self {
        Self::Broker {
            operation,
            site: CallSite::capture(function),
            error,
        }
    }
}

/// Counters returned when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    /// Jobs reserved
    pub reserved: u64,
    /// Jobs handed to the executor
    pub dispatched: u64,
    /// Malformed jobs buried
    pub buried: u64,
    /// Reservations that timed out
    pub timeouts: u64,
    /// Held jobs released back on shutdown
    pub released: u64,
}

/// What the loop does after handling a job
enum Flow {
    Continue,
    Stop,
}

/// Payload as a fetch target, if it is one
///
/// A payload is dispatchable when it is valid UTF-8 and starts with `http`;
/// an empty payload never is.
pub fn target_url(payload: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(payload).ok()?;
    (!text.is_empty() && text.starts_with("http")).then_some(text)
}

/// Resolves once `true` has been sent; never resolves if the sender is gone
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let sender_gone = rx.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

/// Bounded-concurrency consumer for one tube
///
/// # Example
///
/// ```ignore
/// use bns_worker::{Consumer, ConsumerConfig, HttpExecutor, HttpExecutorConfig};
///
/// let conn = BeanstalkConnection::connect("127.0.0.1:11300").await?;
/// let executor = Arc::new(HttpExecutor::new(HttpExecutorConfig::default())?);
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
///
/// let consumer = Consumer::new(conn, executor, ConsumerConfig::new("jobs"), shutdown_rx)?;
/// let report = consumer.run().await?;
/// ```
pub struct Consumer<B> {
    broker: B,
    executor: Arc<dyn TaskExecutor>,
    gate: Arc<AdmissionGate>,
    tracker: TaskTracker,
    config: ConsumerConfig,
    shutdown_rx: watch::Receiver<bool>,
    report: ConsumerReport,
}

impl<B: Broker> Consumer<B> {
    /// Create a consumer owning `broker`
    pub fn new(
        broker: B,
        executor: Arc<dyn TaskExecutor>,
        config: ConsumerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ConsumerError> {
        let gate = Arc::new(AdmissionGate::new(config.concurrency)?);
        Ok(Self {
            broker,
            executor,
            gate,
            tracker: TaskTracker::new(),
            config,
            shutdown_rx,
            report: ConsumerReport::default(),
        })
    }

    /// The admission gate bounding this consumer's fetches
    pub fn gate(&self) -> Arc<AdmissionGate> {
        Arc::clone(&self.gate)
    }

    /// Run until shutdown is signalled or a fatal broker error occurs
    ///
    /// On shutdown, waits up to `shutdown_timeout` for in-flight fetches. A
    /// fatal error returns immediately without draining.
    #[instrument(skip(self), fields(consumer_id = %self.config.consumer_id, tube = %self.config.tube))]
    pub async fn run(mut self) -> Result<ConsumerReport, ConsumerError> {
        self.broker
            .watch_only(&self.config.tube)
            .await
            .map_err(|e| ConsumerError::broker("watch", "Consumer::run", e))?;

        info!(
            concurrency = self.config.concurrency,
            reserve_timeout_ms = self.config.reserve_timeout.as_millis() as u64,
            "Starting consumer"
        );

        self.reserve_loop().await?;
        self.drain().await?;

        info!(report = ?self.report, "Consumer stopped");
        Ok(self.report)
    }

    async fn reserve_loop(&mut self) -> Result<(), ConsumerError> {
        loop {
            let reserved = tokio::select! {
                biased;
                _ = shutdown_signal(&mut self.shutdown_rx) => None,
                reserved = self.broker.reserve(self.config.reserve_timeout) => Some(reserved),
            };

            let job = match reserved {
                None => {
                    debug!("Shutdown requested, no further reservations");
                    return Ok(());
                }
                Some(Ok(job)) => job,
                Some(Err(e)) if e.is_timeout() => {
                    self.report.timeouts += 1;
                    trace!("Reservation timed out");
                    continue;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Reservation failed");
                    return Err(ConsumerError::broker(
                        "reserve",
                        "Consumer::reserve_loop",
                        e,
                    ));
                }
            };

            self.report.reserved += 1;
            if let Flow::Stop = self.handle(job).await? {
                return Ok(());
            }
        }
    }

    /// Validate, dispatch and acknowledge one reserved job
    async fn handle(&mut self, job: Job) -> Result<Flow, ConsumerError> {
        let Some(url) = target_url(&job.payload).map(str::to_string) else {
            warn!(job_id = %job.id, bytes = job.payload.len(), "Malformed payload, burying job");
            self.quarantine(job.id).await;
            return Ok(Flow::Continue);
        };

        let gate = Arc::clone(&self.gate);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let acquired = tokio::select! {
            biased;
            _ = shutdown_signal(&mut shutdown_rx) => None,
            token = gate.acquire() => Some(token),
        };
        let Some(token) = acquired else {
            self.release_held(job.id).await;
            return Ok(Flow::Stop);
        };
        let token = token?;

        let executor = Arc::clone(&self.executor);
        let preview_chars = self.config.preview_chars;
        let job_id = job.id;
        let target = url.clone();
        self.tracker.spawn(async move {
            let record = DispatchRecord::capture(executor.as_ref(), &target, preview_chars).await;
            record.log(job_id);
            drop(token);
        });
        self.report.dispatched += 1;
        debug!(%job_id, %url, in_flight = self.gate.outstanding(), "Dispatched job");

        if let Err(e) = self.broker.delete(job_id).await {
            warn!(%job_id, error = %e, "Failed to delete dispatched job");
        }
        Ok(Flow::Continue)
    }

    async fn quarantine(&mut self, id: JobId) {
        self.report.buried += 1;
        if let Err(e) = self.broker.bury(id, self.config.bury_priority).await {
            warn!(job_id = %id, error = %e, "Failed to bury malformed job");
        }
    }

    /// Hand a reserved but undispatched job back to the ready queue
    async fn release_held(&mut self, id: JobId) {
        match self
            .broker
            .release(id, self.config.release_priority, Duration::ZERO)
            .await
        {
            Ok(()) => {
                self.report.released += 1;
                info!(job_id = %id, "Released held job on shutdown");
            }
            Err(e) => warn!(job_id = %id, error = %e, "Failed to release held job"),
        }
    }

    async fn drain(&mut self) -> Result<(), ConsumerError> {
        self.gate.close();
        self.tracker.close();

        let outstanding = self.gate.outstanding();
        if outstanding > 0 {
            info!(outstanding, "Waiting for in-flight fetches");
        }

        match tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait()).await {
            Ok(()) => {
                debug!("All fetches completed");
                Ok(())
            }
            Err(_) => {
                let outstanding = self.gate.outstanding();
                warn!(outstanding, "Shutdown timeout reached");
                Err(ConsumerError::ShutdownTimeout { outstanding })
            }
        }
    }
}
