use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by [`ResourcePool`](crate::resources::ResourcePool).
#[derive(Debug, Error)]
pub enum PoolError {
    /// No identity became eligible before the acquire timeout. Retryable.
    #[error("no egress identity became eligible within {waited:?}")]
    Exhausted { waited: Duration },

    /// Release of an identity that is not currently leased (never acquired or
    /// already released).
    #[error("resource {0} is not leased")]
    NotLeased(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("resource {0} is leased and cannot be evicted")]
    Busy(String),

    #[error("resource pool has no identities configured")]
    Empty,

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed ledger {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures surfaced to callers of [`WorkerPool::submit`](crate::worker_pool::WorkerPool::submit).
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid work descriptor: {0}")]
    Invalid(String),

    #[error("job queue is full")]
    QueueFull,

    #[error("job queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("audit log {path} is malformed: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("attempt {attempt} of job {job_id} is already recorded")]
    Duplicate { job_id: String, attempt: u32 },
}

/// What an external collaborator (fetcher, generator, writer, exporter)
/// reports when it cannot do its work.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The downstream service blocked the leased egress identity.
    #[error("upstream rejected the request: {0}")]
    Rejected(String),

    /// Network blip, rate limit or other failure worth retrying.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// The input can never succeed (unknown video, no transcript).
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy for a failed job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ResourceExhausted,
    UpstreamRejected,
    UpstreamTransient,
    ValidationError,
    IoError,
    Timeout,
    /// A stage panicked; caught at the worker boundary.
    Internal,
}

impl ErrorKind {
    /// Whether the retry coordinator may resubmit a job that failed this way.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ResourceExhausted
                | ErrorKind::UpstreamRejected
                | ErrorKind::UpstreamTransient
                | ErrorKind::Timeout
        )
    }

    /// Kinds whose retry only makes sense once some identity is eligible again.
    pub fn waits_on_resources(self) -> bool {
        matches!(self, ErrorKind::ResourceExhausted | ErrorKind::UpstreamRejected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::UpstreamRejected => "UpstreamRejected",
            ErrorKind::UpstreamTransient => "UpstreamTransient",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::IoError => "IOError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

impl From<&CollaboratorError> for ErrorKind {
    fn from(err: &CollaboratorError) -> Self {
        match err {
            CollaboratorError::Rejected(_) => ErrorKind::UpstreamRejected,
            CollaboratorError::Transient(_) => ErrorKind::UpstreamTransient,
            CollaboratorError::Invalid(_) => ErrorKind::ValidationError,
            CollaboratorError::Io(_) => ErrorKind::IoError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::ResourceExhausted.is_retryable());
        assert!(ErrorKind::UpstreamRejected.is_retryable());
        assert!(ErrorKind::UpstreamTransient.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::ValidationError.is_retryable());
        assert!(!ErrorKind::IoError.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn collaborator_error_maps_to_kind() {
        let rejected = CollaboratorError::Rejected("captcha".into());
        assert_eq!(ErrorKind::from(&rejected), ErrorKind::UpstreamRejected);

        let io = CollaboratorError::Io(std::io::Error::other("disk full"));
        assert_eq!(ErrorKind::from(&io), ErrorKind::IoError);
    }

    #[test]
    fn pool_error_display() {
        let err = PoolError::NotLeased("10.0.0.1".into());
        assert_eq!(err.to_string(), "resource 10.0.0.1 is not leased");
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::IoError.to_string(), "IOError");
        assert_eq!(ErrorKind::UpstreamRejected.to_string(), "UpstreamRejected");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PoolError>();
        assert_send_sync::<CollaboratorError>();
    }
}
