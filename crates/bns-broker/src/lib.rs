//! # Broker client
//!
//! A minimal async client for the beanstalkd work-queue protocol, plus an
//! in-memory broker with matching semantics for tests.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Broker (trait)                        │
//! │   use / watch / ignore / put / reserve / delete / bury ...   │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                  │
//!              ▼                                  ▼
//! ┌───────────────────────────┐    ┌───────────────────────────┐
//! │    BeanstalkConnection    │    │     InMemoryConnection     │
//! │  (TCP, CRLF text framing) │    │  (shared InMemoryBroker)   │
//! └───────────────────────────┘    └───────────────────────────┘
//! ```
//!
//! A connection is a single conversation with the server and is not shared:
//! every [`Broker`] method takes `&mut self`.
//!
//! ## Example
//!
//! ```ignore
//! use bns_broker::{BeanstalkConnection, Broker};
//! use std::time::Duration;
//!
//! let mut conn = BeanstalkConnection::connect("127.0.0.1:11300").await?;
//! conn.use_tube("jobs").await?;
//! let id = conn
//!     .put(b"http://local.com/api/address", 1, Duration::ZERO, Duration::from_secs(120))
//!     .await?;
//! ```

mod beanstalk;
mod broker;
mod error;
mod job;
mod memory;
mod protocol;
mod stats;

pub use beanstalk::BeanstalkConnection;
pub use broker::{Broker, DEFAULT_TUBE};
pub use error::BrokerError;
pub use job::{Job, JobId};
pub use memory::{BrokerOp, InMemoryBroker, InMemoryConnection, JobState};
pub use protocol::validate_tube_name;
pub use stats::Stats;
