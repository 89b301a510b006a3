//! Admission gate
//!
//! A fixed pool of tokens bounding how many task executions may run at once.
//! The consumption loop takes a token before dispatching a job; the token is
//! returned when the spawned execution drops it, whatever the outcome.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Admission gate errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// Capacity must be at least one
    #[error("admission gate capacity must be at least 1")]
    InvalidCapacity,

    /// The gate was closed and hands out no more tokens
    #[error("admission gate is closed")]
    Closed,

    /// Every token is currently out (only from `try_acquire`)
    #[error("no admission tokens available")]
    Exhausted,
}

/// Counting semaphore of fixed capacity
///
/// Tokens are handed out in FIFO order of `acquire` calls. Outstanding tokens
/// never exceed the capacity and are returned by dropping the
/// [`AdmissionToken`], so no execution path can leak one.
///
/// # Example
///
/// ```
/// use bns_worker::gate::AdmissionGate;
///
/// # tokio_test::block_on(async {
/// let gate = AdmissionGate::new(2).unwrap();
/// let token = gate.acquire().await.unwrap();
/// assert_eq!(gate.outstanding(), 1);
/// drop(token);
/// assert_eq!(gate.outstanding(), 0);
/// # });
/// ```
#[derive(Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// One unit of admission capacity; returned to the gate on drop
#[derive(Debug)]
#[must_use = "dropping the token returns it to the gate immediately"]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Create a gate holding `capacity` tokens
    pub fn new(capacity: usize) -> Result<Self, GateError> {
        if capacity == 0 {
            return Err(GateError::InvalidCapacity);
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Wait for a token
    ///
    /// Fails only when the gate has been closed.
    pub async fn acquire(&self) -> Result<AdmissionToken, GateError> {
        if self.permits.available_permits() == 0 {
            debug!(capacity = self.capacity, "Admission gate full, waiting for a token");
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;
        Ok(AdmissionToken { _permit: permit })
    }

    /// Take a token without waiting
    pub fn try_acquire(&self) -> Result<AdmissionToken, GateError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(AdmissionToken { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(GateError::Exhausted),
            Err(TryAcquireError::Closed) => Err(GateError::Closed),
        }
    }

    /// Total number of tokens
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently available
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Tokens currently held by executions
    pub fn outstanding(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Stop handing out tokens
    ///
    /// Pending and future `acquire` calls fail with [`GateError::Closed`].
    /// Tokens already out are still returned normally.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
