// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error taxonomy for runner-layer operations
//!
//! Every public operation returns an [`Error`] carrying the operation name,
//! the workload it addressed (when known), the underlying cause, and a
//! retryability classification. Drivers map substrate SDK failures into
//! [`ErrorKind`]; the lifecycle engine only ever annotates, it never retries.

use std::fmt;

use thiserror::Error;

/// Result type for runner-layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure cause.
///
/// The variants mirror the partial-failure semantics of talking to a remote
/// substrate: connection-layer problems are retryable, rejections of the
/// request itself are not.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Spec rejected before any side effect took place
    #[error("invalid workload spec: {0}")]
    Validation(String),

    /// The workload has no object on the substrate
    #[error("no substrate object for '{0}'")]
    NotFound(String),

    /// Create raced with an existing object of the same deterministic name
    #[error("substrate object '{0}' already exists")]
    AlreadyExists(String),

    /// Connection or TLS failure reaching the substrate
    #[error("substrate unreachable: {0}")]
    Unreachable(String),

    /// Rate limit, temporary resource exhaustion, or quota
    #[error("substrate transient failure: {0}")]
    Transient(String),

    /// Forbidden, bad credentials, or schema rejected by the substrate
    #[error("substrate rejected the request: {0}")]
    Permanent(String),

    /// Requested resources exceed what the substrate allows
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// No driver is registered for the requested substrate tag
    #[error("unsupported substrate '{0}'")]
    UnsupportedSubstrate(String),

    /// The driver exists but does not implement this operation
    #[error("{substrate} substrate does not support this operation yet")]
    NotSupported {
        /// Substrate tag of the stub driver.
        substrate: &'static str,
    },

    /// The caller's cancellation context fired mid-operation
    #[error("operation cancelled")]
    Cancelled,

    /// A status-change hook panicked; recovered at the engine boundary
    #[error("hook panicked: {0}")]
    HookPanicked(String),

    /// Config or result document could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure while materializing artifacts on a local substrate
    #[error("artifact i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// Anything the substrate SDK reported that fits no other bucket
    #[error("{0}")]
    Other(String),
}

impl ErrorKind {
    /// Whether a caller-side retry of the same request can succeed.
    ///
    /// Retry policy itself is deliberately absent from the core; callers
    /// apply backoff and jitter using this flag.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Unreachable(_) | ErrorKind::Transient(_))
    }
}

/// Structured failure of one runner-layer operation.
///
/// Wraps an [`ErrorKind`] with the operation name and, when one was in
/// scope, the workload identifier. Constructed by drivers via
/// [`Error::new`] and re-annotated by the lifecycle engine via
/// [`Error::with_operation`].
#[derive(Debug)]
pub struct Error {
    operation: String,
    workload: Option<String>,
    kind: ErrorKind,
}

impl Error {
    /// Wrap a cause with the name of the failing operation.
    pub fn new(operation: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            operation: operation.into(),
            workload: None,
            kind,
        }
    }

    /// Attach the workload the operation addressed.
    #[must_use]
    pub fn with_workload(mut self, workload: impl fmt::Display) -> Self {
        self.workload = Some(workload.to_string());
        self
    }

    /// Replace the operation name, keeping cause and workload.
    ///
    /// Used by the lifecycle engine to re-label driver errors with the
    /// public operation the caller invoked.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Name of the operation that failed, e.g. `"create"`.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Workload identifier, when the operation addressed one.
    #[must_use]
    pub fn workload(&self) -> Option<&str> {
        self.workload.as_deref()
    }

    /// The classified cause.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Whether a caller-side retry of the same request can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Shorthand for a [`ErrorKind::Validation`] failure.
    pub fn validation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::Validation(reason.into()))
    }

    /// Shorthand for a [`ErrorKind::NotFound`] failure.
    pub fn not_found(operation: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::NotFound(name.into()))
    }

    /// Shorthand for a [`ErrorKind::Cancelled`] failure.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.workload {
            Some(workload) => write!(f, "{} failed for workload {}", self.operation, workload),
            None => write!(f, "{} failed", self.operation),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_classification() {
        assert!(ErrorKind::Unreachable("tls handshake".into()).is_retryable());
        assert!(ErrorKind::Transient("rate limited".into()).is_retryable());

        assert!(!ErrorKind::Validation("empty config".into()).is_retryable());
        assert!(!ErrorKind::NotFound("quantflow-bot-x".into()).is_retryable());
        assert!(!ErrorKind::AlreadyExists("quantflow-bot-x".into()).is_retryable());
        assert!(!ErrorKind::Permanent("forbidden".into()).is_retryable());
        assert!(!ErrorKind::ResourceLimit("memory".into()).is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::NotSupported { substrate: "local" }.is_retryable());
    }

    #[test]
    fn display_carries_operation_and_workload() {
        let err = Error::new("create", ErrorKind::AlreadyExists("quantflow-bot-b1".into()))
            .with_workload("b1");
        assert_eq!(err.to_string(), "create failed for workload b1");
        assert_eq!(err.operation(), "create");
        assert_eq!(err.workload(), Some("b1"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn relabelling_keeps_cause() {
        let err = Error::new("inspect", ErrorKind::Unreachable("connection refused".into()))
            .with_operation("get-status");
        assert_eq!(err.operation(), "get-status");
        assert!(err.is_retryable());
    }
}
