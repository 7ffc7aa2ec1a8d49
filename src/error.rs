//! Error types for the Redis cluster operator.
//!
//! Errors come in two layers:
//!
//! - [`Error`] says *what* failed: the Kubernetes API, the Redis administrative
//!   protocol, spec validation, a wait that timed out, and so on.
//! - [`SyncError`] is an [`Error`] tagged with the reconcile step that produced it
//!   and an [`ErrorKind`]. The kind is the only thing the control loop looks at
//!   when it decides how to schedule the next attempt (see [`Disposition`]).
//!
//! # Example
//!
//! ```rust
//! use redis_cluster_operator::error::{Disposition, Error, ErrorKind};
//!
//! let err = ErrorKind::Requeue.wrap(Error::Timeout("statefulset update".into()), "WaitStatefulSetUpdating");
//! assert_eq!(err.disposition(), Disposition::RequeueAfter);
//! assert_eq!(err.step(), "WaitStatefulSetUpdating");
//! ```

use std::fmt;

use thiserror::Error;

/// Failures of the Redis administrative protocol.
#[derive(Error, Debug)]
pub enum RedisError {
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no connection to {0}")]
    NoConnection(String),

    #[error("{addr} replied with error: {message}")]
    Server { addr: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unexpected reply from {addr}: {reply}")]
    UnexpectedReply { addr: String, reply: String },

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("cluster view is inconsistent: {0}")]
    Inconsistent(String),

    #[error("node {0} is not empty! Reshard data away and try again")]
    NodeNotEmpty(String),
}

impl RedisError {
    /// True when the connection may hold an unread or partial reply and must not be reused.
    pub fn breaks_connection(&self) -> bool {
        matches!(self, RedisError::Connection { .. } | RedisError::Protocol(_))
    }
}

/// Main error type for the operator.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Redis admin error: {0}")]
    Redis(#[from] RedisError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Backup {name} could not be fetched: {source}")]
    BackupUnavailable {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("Backup {0} has not succeeded yet")]
    BackupNotReady(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("{group}: expected {expected} ready nodes, found {found}")]
    NodeCount {
        group: String,
        expected: i32,
        found: i32,
    },

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a topology error with the given message
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    /// Whether waiting and retrying can make this error go away.
    ///
    /// Kubernetes API errors are retryable unless the API server rejected the
    /// request itself (bad request, forbidden, not found, invalid).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => kube_retryable(e),
            Error::Redis(e) => !matches!(e, RedisError::NodeNotEmpty(_)),
            Error::BackupUnavailable { .. }
            | Error::BackupNotReady(_)
            | Error::Timeout(_)
            | Error::NodeCount { .. }
            | Error::Io(_) => true,
            Error::InvalidConfig(_)
            | Error::Validation(_)
            | Error::NotFound(_)
            | Error::Topology(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Conditions an operator has to resolve by hand.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Redis(RedisError::NodeNotEmpty(_)))
    }
}

fn kube_retryable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => !matches!(resp.code, 400 | 401 | 403 | 404 | 422),
        _ => true,
    }
}

/// How the control loop should react to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Failure from the Kubernetes API. Retried with standard backoff.
    Kubernetes,
    /// Precondition that will not resolve by waiting. Not requeued.
    StopRetry,
    /// Transient condition expected to resolve shortly. Requeued after a fixed delay.
    Requeue,
    /// Failure from the Redis administrative protocol. Retried with standard backoff.
    Redis,
    /// Failure computing or applying a topology plan. Retried with standard backoff.
    Cluster,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Kubernetes => "kubernetes",
            ErrorKind::StopRetry => "stop_retry",
            ErrorKind::Requeue => "requeue",
            ErrorKind::Redis => "redis",
            ErrorKind::Cluster => "cluster",
        }
    }

    /// Tag `source` with this kind and the name of the step that failed.
    pub fn wrap(self, source: impl Into<Error>, step: &'static str) -> SyncError {
        let source = source.into();
        SyncError {
            kind: self,
            step,
            fatal: source.is_fatal(),
            source,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling decision derived from a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry with exponential backoff.
    Backoff,
    /// Retry after the configured short fixed delay.
    RequeueAfter,
    /// Do not retry until the resource changes.
    StopRetry,
}

/// A step failure carrying its kind, the step name and the original cause.
#[derive(Error, Debug)]
#[error("{kind}: {step}: {source}")]
pub struct SyncError {
    kind: ErrorKind,
    step: &'static str,
    fatal: bool,
    #[source]
    source: Error,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    pub fn cause(&self) -> &Error {
        &self.source
    }

    /// True for Redis-side conditions that need operator action, e.g. a
    /// non-empty node selected for retirement.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn disposition(&self) -> Disposition {
        if self.fatal {
            return Disposition::StopRetry;
        }
        match self.kind {
            ErrorKind::StopRetry => Disposition::StopRetry,
            ErrorKind::Requeue => Disposition::RequeueAfter,
            ErrorKind::Kubernetes | ErrorKind::Redis | ErrorKind::Cluster => Disposition::Backoff,
        }
    }
}

/// Result type alias for operator operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result of one reconcile step.
pub type SyncResult<T = ()> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_kube_errors_retryable_by_status_code() {
        assert!(Error::Kube(api_error(500)).is_retryable());
        assert!(Error::Kube(api_error(409)).is_retryable());
        assert!(Error::Kube(api_error(429)).is_retryable());
        assert!(!Error::Kube(api_error(404)).is_retryable());
        assert!(!Error::Kube(api_error(422)).is_retryable());
    }

    #[test]
    fn test_backup_errors_are_retryable() {
        let err = Error::BackupUnavailable {
            name: "default/backup".to_string(),
            source: api_error(404),
        };
        assert!(err.is_retryable());
        assert!(Error::BackupNotReady("default/backup".into()).is_retryable());
        assert!(!Error::validation("backupSource is required").is_retryable());
    }

    #[test]
    fn test_disposition_by_kind() {
        let cause = || Error::topology("no node in group 2");
        assert_eq!(ErrorKind::Kubernetes.wrap(cause(), "step").disposition(), Disposition::Backoff);
        assert_eq!(ErrorKind::Redis.wrap(cause(), "step").disposition(), Disposition::Backoff);
        assert_eq!(ErrorKind::Cluster.wrap(cause(), "step").disposition(), Disposition::Backoff);
        assert_eq!(ErrorKind::Requeue.wrap(cause(), "step").disposition(), Disposition::RequeueAfter);
        assert_eq!(ErrorKind::StopRetry.wrap(cause(), "step").disposition(), Disposition::StopRetry);
    }

    #[test]
    fn test_non_empty_node_is_fatal() {
        let err = ErrorKind::Redis.wrap(RedisError::NodeNotEmpty("abc 10.0.0.4:6379".into()), "ForgetNode");
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::Redis);
        assert_eq!(err.disposition(), Disposition::StopRetry);
        assert!(err.to_string().contains("not empty"));
    }

    #[test]
    fn test_wrap_preserves_cause_and_step() {
        let err = ErrorKind::Kubernetes.wrap(Error::NotFound("drc-demo-0".into()), "GetStatefulSet");
        assert_eq!(err.step(), "GetStatefulSet");
        assert!(matches!(err.cause(), Error::NotFound(name) if name == "drc-demo-0"));
        assert_eq!(err.to_string(), "kubernetes: GetStatefulSet: Resource not found: drc-demo-0");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_broken_connection_errors() {
        let timeout = RedisError::Connection {
            addr: "10.0.0.1:6379".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "command timed out"),
        };
        assert!(timeout.breaks_connection());
        assert!(RedisError::Protocol("connection closed".into()).breaks_connection());
        let refused = RedisError::Server {
            addr: "10.0.0.1:6379".to_string(),
            message: "ERR unknown node".to_string(),
        };
        assert!(!refused.breaks_connection());
    }
}
