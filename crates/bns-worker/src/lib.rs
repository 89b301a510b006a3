//! # Consumer runtime
//!
//! Drives a [`bns_broker::Broker`] connection: reserves jobs, validates
//! their payloads, and dispatches each one as an HTTP GET without ever
//! exceeding a fixed number of in-flight requests.
//!
//! ## Features
//!
//! - **Admission gate**: counting gate with RAII tokens bounding concurrent fetches
//! - **Consumption loop**: reserve, quarantine malformed payloads, dispatch, acknowledge
//! - **Graceful shutdown**: held job released, in-flight fetches drained with a deadline
//! - **Producer and status**: bulk enqueue and tube and server statistics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Consumer                            │
//! │     reserve ─► validate ─► acquire token ─► spawn ─► delete  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                       │                  │
//!          ▼                       ▼                  ▼
//! ┌─────────────────┐   ┌───────────────────┐   ┌────────────────┐
//! │     Broker      │   │   AdmissionGate   │   │  TaskExecutor  │
//! │  (one conn)     │   │  (N tokens)       │   │  (HTTP GET)    │
//! └─────────────────┘   └───────────────────┘   └────────────────┘
//! ```
//!
//! Jobs are deleted as soon as their fetch is spawned, so each payload is
//! attempted at most once.

mod consumer;
mod duration_millis;
mod error;
mod executor;
pub mod gate;
mod producer;
mod status;

/// Prelude for common imports
pub mod prelude {
    pub use crate::consumer::{Consumer, ConsumerConfig, ConsumerError, ConsumerReport};
    pub use crate::executor::{HttpExecutor, HttpExecutorConfig, TaskExecutor};
    pub use crate::gate::{AdmissionGate, AdmissionToken, GateError};
    pub use crate::producer::{Producer, ProducerConfig, ProducerError};
    pub use crate::status::{server_status, tube_status, ServerStatus, StatusError, TubeStatus};
}

pub use consumer::{
    target_url, Consumer, ConsumerConfig, ConsumerError, ConsumerReport, BURY_PRIORITY,
    DEFAULT_CONCURRENCY,
};
pub use error::CallSite;
pub use executor::{
    DispatchOutcome, DispatchRecord, FetchError, FetchResponse, HttpExecutor, HttpExecutorConfig,
    TaskExecutor, DEFAULT_PREVIEW_CHARS,
};
pub use gate::{AdmissionGate, AdmissionToken, GateError};
pub use producer::{Producer, ProducerConfig, ProducerError, DEFAULT_PAYLOAD};
pub use status::{server_status, tube_status, ServerStatus, StatusError, TubeStatus};
