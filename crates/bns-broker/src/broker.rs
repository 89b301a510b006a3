//! Broker trait definition

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::job::{Job, JobId};
use crate::stats::Stats;

/// Tube every new connection uses and watches
pub const DEFAULT_TUBE: &str = "default";

/// Client capability set of a beanstalkd-style work-queue broker
///
/// Each value is one connection with its own tube selection. Methods take
/// `&mut self` because requests on a connection are strictly sequential.
#[async_trait]
pub trait Broker: Send {
    /// Select the tube subsequent `put` calls insert into
    async fn use_tube(&mut self, tube: &str) -> Result<(), BrokerError>;

    /// Add a tube to the watch list; returns the number of watched tubes
    async fn watch(&mut self, tube: &str) -> Result<u32, BrokerError>;

    /// Remove a tube from the watch list; returns the number of watched tubes
    async fn ignore(&mut self, tube: &str) -> Result<u32, BrokerError>;

    /// Insert a job into the used tube
    async fn put(
        &mut self,
        payload: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId, BrokerError>;

    /// Reserve a job from any watched tube
    ///
    /// Fails with [`BrokerError::TimedOut`] when no job became ready in time.
    async fn reserve(&mut self, timeout: Duration) -> Result<Job, BrokerError>;

    /// Delete a reserved job
    async fn delete(&mut self, id: JobId) -> Result<(), BrokerError>;

    /// Bury a reserved job until an operator kicks it
    async fn bury(&mut self, id: JobId, priority: u32) -> Result<(), BrokerError>;

    /// Put a reserved job back into the ready queue
    async fn release(&mut self, id: JobId, priority: u32, delay: Duration)
        -> Result<(), BrokerError>;

    /// Statistics for a single tube
    async fn stats_tube(&mut self, tube: &str) -> Result<Stats, BrokerError>;

    /// Server-wide statistics
    async fn stats(&mut self) -> Result<Stats, BrokerError>;

    /// Names of all existing tubes
    async fn list_tubes(&mut self) -> Result<Vec<String>, BrokerError>;

    /// Watch exactly one tube, dropping the default tube if it differs
    async fn watch_only(&mut self, tube: &str) -> Result<(), BrokerError> {
        self.watch(tube).await?;
        if tube != DEFAULT_TUBE {
            self.ignore(DEFAULT_TUBE).await?;
        }
        Ok(())
    }
}
