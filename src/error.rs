use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by a single dispatch attempt.
///
/// Non-2xx responses are not errors at this layer: the dispatcher hands
/// back the response and the state machine decides what it means.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// DNS, connect, TLS, timeout or body read failure.
    /// Retryable.
    #[error("network error: {message}")]
    Network {
        message: String,
        timed_out: bool,
    },

    /// Request rejected by transport policy before any bytes were sent.
    /// Never retried.
    #[error("policy violation: {0}")]
    PolicyViolation(String),
}

impl DispatchError {
    pub fn network(message: impl Into<String>) -> Self {
        DispatchError::Network {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        DispatchError::Network {
            message: message.into(),
            timed_out: true,
        }
    }

    pub fn policy(message: impl Into<String>) -> Self {
        DispatchError::PolicyViolation(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Network { .. })
    }
}

/// Infrastructure failure in a repository.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{kind} not found: {id}")]
    NotFound {
        kind: &'static str,
        id: String,
    },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("document encoding error: {0}")]
    Encoding(String),
}

impl RepositoryError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RepositoryError::NotFound { kind, id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Encoding(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is shut down")]
    Shutdown,

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("job encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Which pipeline a retryable failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    EndpointDeliveryFailed,
    MetaEventDeliveryFailed,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryFailure::EndpointDeliveryFailed =>
                write!(f, "endpoint delivery failed"),
            DeliveryFailure::MetaEventDeliveryFailed =>
                write!(f, "meta event delivery failed"),
        }
    }
}

/// Domain-level retry request.
///
/// Carries the delay the queue adapter must use when it re-enqueues the
/// task. The queue never infers this from an unclassified error.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{reason}, retrying in {delay:?}")]
pub struct RetryableError {
    pub reason: DeliveryFailure,
    pub delay: Duration,
}

/// Result of processing one task, as seen by the worker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessError {
    /// Delivery failed and the retry budget allows another attempt.
    #[error(transparent)]
    Retry(#[from] RetryableError),

    /// Malformed payload or missing entity. The task is dropped.
    #[error("invalid task: {0}")]
    Validation(String),

    /// Load or persist failed. Eligible for queue-level retry.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
