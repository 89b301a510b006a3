//! Broker error types

use crate::job::JobId;

/// Errors returned by [`Broker`](crate::Broker) operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The server could not be reached
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure on an established connection
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection
    #[error("connection closed by server")]
    ConnectionClosed,

    /// `reserve-with-timeout` expired without a job
    #[error("reserve-with-timeout: timeout")]
    TimedOut,

    /// A job reserved by this connection is about to exceed its TTR
    #[error("reserve-with-timeout: deadline soon")]
    DeadlineSoon,

    /// The job or tube does not exist (or is not reserved by this connection)
    #[error("{command}: not found")]
    NotFound { command: &'static str },

    /// `put` succeeded but the server buried the job (out of memory)
    #[error("put: job {0} buried by server")]
    PutBuried(JobId),

    /// The job body exceeds the server's `max-job-size`
    #[error("put: job too big")]
    JobTooBig,

    /// The server is in drain mode and refuses new jobs
    #[error("put: server is draining")]
    Draining,

    /// The body was not terminated by CRLF
    #[error("put: expected CRLF")]
    ExpectedCrlf,

    /// `ignore` was refused because it would leave the watch list empty
    #[error("ignore: not ignored")]
    NotIgnored,

    /// Invalid tube name
    #[error("invalid tube name {name:?}: {reason}")]
    InvalidTubeName { name: String, reason: &'static str },

    /// Generic server error (`OUT_OF_MEMORY`, `INTERNAL_ERROR`, `BAD_FORMAT`, `UNKNOWN_COMMAND`)
    #[error("{command}: server error {code}")]
    Server { command: &'static str, code: String },

    /// A reply that does not fit the command that was sent
    #[error("{command}: unexpected response {line:?}")]
    UnexpectedResponse { command: &'static str, line: String },

    /// A statistics body that is not the expected YAML document
    #[error("malformed stats body: {0}")]
    Stats(String),
}

impl BrokerError {
    /// Whether this is a transient reservation outcome that should simply be retried
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut | Self::DeadlineSoon)
    }
}
