//! Production loop
//!
//! Puts a fixed number of identical jobs into one tube, sequentially. The
//! first failure ends the run.

use std::time::Duration;

use bns_broker::{Broker, BrokerError, JobId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::CallSite;

/// Payload the producer enqueues unless told otherwise
pub const DEFAULT_PAYLOAD: &str = "http://local.com/api/address";

/// Producer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Tube to put jobs into
    pub tube: String,

    /// Body of every job
    pub payload: String,

    /// Number of jobs to put
    pub count: usize,

    /// Job priority (0 is most urgent)
    pub priority: u32,

    /// Delay before each job becomes ready
    #[serde(with = "crate::duration_millis")]
    pub delay: Duration,

    /// Time-to-run granted to a consumer per reservation
    #[serde(with = "crate::duration_millis")]
    pub ttr: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            tube: bns_broker::DEFAULT_TUBE.to_string(),
            payload: DEFAULT_PAYLOAD.to_string(),
            count: 1000,
            priority: 1,
            delay: Duration::ZERO,
            ttr: Duration::from_secs(120),
        }
    }
}

impl ProducerConfig {
    /// Create a configuration producing into `tube`
    pub fn new(tube: impl Into<String>) -> Self {
        Self {
            tube: tube.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_ttr(mut self, ttr: Duration) -> Self {
        self.ttr = ttr;
        self
    }
}

/// Producer errors
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    /// Selecting the tube failed
    #[error("{site}: use {tube}: {error}")]
    UseTube {
        tube: String,
        site: CallSite,
        error: BrokerError,
    },

    /// A put failed; `index` jobs were inserted before it
    #[error("{site}: put #{index}: {error}")]
    Put {
        index: usize,
        site: CallSite,
        error: BrokerError,
    },
}

/// Sequential job producer
pub struct Producer<B> {
    broker: B,
    config: ProducerConfig,
}

impl<B: Broker> Producer<B> {
    pub fn new(broker: B, config: ProducerConfig) -> Self {
        Self { broker, config }
    }

    /// Put `count` jobs, calling `on_put` with each new job id
    ///
    /// Returns the number of jobs inserted.
    #[instrument(skip(self, on_put), fields(tube = %self.config.tube, count = self.config.count))]
    pub async fn run<F>(mut self, mut on_put: F) -> Result<usize, ProducerError>
    where
        F: FnMut(JobId) + Send,
    {
        self.broker
            .use_tube(&self.config.tube)
            .await
            .map_err(|error| ProducerError::UseTube {
                tube: self.config.tube.clone(),
                site: CallSite::capture("Producer::run"),
                error,
            })?;

        let payload = self.config.payload.as_bytes();
        for index in 0..self.config.count {
            let id = self
                .broker
                .put(payload, self.config.priority, self.config.delay, self.config.ttr)
                .await
                .map_err(|error| ProducerError::Put {
                    index,
                    site: CallSite::capture("Producer::run"),
                    error,
                })?;
            debug!(job_id = %id, index, "Put job");
            on_put(id);
        }

        info!(count = self.config.count, "All jobs put");
        Ok(self.config.count)
    }
}

#[cfg(test)]
mod tests {
    use bns_broker::{InMemoryBroker, JobState};

    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProducerConfig::default();
        assert_eq!(config.payload, "http://local.com/api/address");
        assert_eq!(config.count, 1000);
        assert_eq!(config.priority, 1);
        assert_eq!(config.delay, Duration::ZERO);
        assert_eq!(config.ttr, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_puts_count_jobs_into_tube() {
        let broker = InMemoryBroker::new();
        let config = ProducerConfig::new("jobs")
            .with_count(5)
            .with_payload("http://a/b");

        let mut ids = Vec::new();
        let put = Producer::new(broker.connect(), config)
            .run(|id| ids.push(id))
            .await
            .unwrap();

        assert_eq!(put, 5);
        assert_eq!(ids.len(), 5);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(broker.count(JobState::Ready), 5);

        let mut consumer = broker.connect();
        consumer.watch_only("jobs").await.unwrap();
        let job = consumer.reserve(Duration::from_secs(1)).await.unwrap();
        assert_eq!(job.payload, b"http://a/b");
    }

    #[tokio::test]
    async fn test_invalid_tube_is_fatal() {
        let broker = InMemoryBroker::new();
        let result = Producer::new(broker.connect(), ProducerConfig::new("bad tube"))
            .run(|_| {})
            .await;

        assert!(matches!(result, Err(ProducerError::UseTube { .. })));
        assert_eq!(broker.count(JobState::Ready), 0);
    }

    #[tokio::test]
    async fn test_zero_count_puts_nothing() {
        let broker = InMemoryBroker::new();
        let put = Producer::new(broker.connect(), ProducerConfig::new("jobs").with_count(0))
            .run(|_| panic!("no job expected"))
            .await
            .unwrap();

        assert_eq!(put, 0);
    }
}
