//! Error types shared across the crate.

use std::time::Duration;
use thiserror::Error;

/// Failures establishing or keeping a broker connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("broker address is not configured")]
    Unconfigured,
    #[error("broker did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("gave up connecting after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("broker error: {0}")]
    Fatal(String),
}

impl ConnectionError {
    /// Transient errors are worth reconnecting for; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionError::Transient(_))
    }
}

/// Errors returned by the queue registry and broker adapters.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    ConnectionUnavailable(#[from] ConnectionError),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("job {id} not found in queue {queue}")]
    JobNotFound { queue: String, id: String },
    #[error("payload rejected: {0}")]
    PayloadRejected(String),
    #[error("broker error: {message}")]
    Broker { message: String, transient: bool },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn job_not_found(queue: &str, id: &str) -> Self {
        QueueError::JobNotFound {
            queue: queue.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether the same call may succeed if simply repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Broker { transient, .. } => *transient,
            QueueError::ConnectionUnavailable(err) => matches!(
                err,
                ConnectionError::Transient(_)
                    | ConnectionError::StartupTimeout(_)
                    | ConnectionError::RetriesExhausted { .. }
            ),
            _ => false,
        }
    }
}

/// Outcome of a single handler attempt that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Retried while attempts remain.
    #[error("{0}")]
    Failed(String),
    /// Moves the job straight to `failed` regardless of remaining attempts.
    #[error("{0}")]
    Fatal(String),
    #[error("Timeout")]
    Timeout,
}

impl JobError {
    pub fn failed(reason: impl Into<String>) -> Self {
        JobError::Failed(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        JobError::Fatal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Fatal(_))
    }
}
