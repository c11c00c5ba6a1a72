//! Crate-wide error taxonomy.
//!
//! Every failure that leaves a pipeline is one of four kinds: bad caller
//! input, a failed embedding call, a failed generation call, or a failed
//! store operation. Remote-service failures carry a [`FailureKind`] so
//! callers can decide whether a retry with backoff makes sense.
use std::fmt;

use thiserror::Error;

/// Why a remote service call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The call exceeded its time bound.
    Timeout,
    /// Connection failure or 5xx status.
    Unavailable,
    /// 4xx status: the service refused the request as sent.
    Rejected,
    /// The service answered, but not in a shape we can use.
    MalformedResponse,
}

impl FailureKind {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
            Self::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure detail for a call to a remote model service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: FailureKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedResponse, message)
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let kind = if status.is_server_error() {
            FailureKind::Unavailable
        } else {
            FailureKind::Rejected
        };
        let body = body.trim();
        let message = if body.is_empty() {
            format!("service returned {status}")
        } else {
            format!("service returned {status}: {body}")
        };
        Self::new(kind, message)
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if err.is_decode() {
            FailureKind::MalformedResponse
        } else if err.is_builder() {
            FailureKind::Rejected
        } else {
            FailureKind::Unavailable
        };
        Self::new(kind, err.to_string())
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding service error: {0}")]
    Embedding(ServiceError),

    #[error("generation service error: {0}")]
    Generation(ServiceError),

    #[error("storage error: {message}")]
    Storage { message: String, timed_out: bool },
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Whether a caller may retry the same request with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidInput(_) => false,
            Self::Embedding(e) | Self::Generation(e) => e.is_retryable(),
            Self::Storage { timed_out, .. } => *timed_out,
        }
    }

    /// Stable label for structured error payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Embedding(_) => "embedding_service_error",
            Self::Generation(_) => "generation_service_error",
            Self::Storage { .. } => "storage_error",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        // SQLite raises an interrupt when a statement outlives its deadline
        if err.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted) {
            return Self::Storage {
                message: format!("store operation interrupted at its deadline: {err}"),
                timed_out: true,
            };
        }
        Self::storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::Unavailable.is_retryable());
        assert!(!FailureKind::Rejected.is_retryable());
        assert!(!FailureKind::MalformedResponse.is_retryable());
    }

    #[test]
    fn test_status_classification() {
        let e = ServiceError::from_status(reqwest::StatusCode::BAD_GATEWAY, "");
        assert_eq!(e.kind, FailureKind::Unavailable);
        assert!(e.is_retryable());

        let e = ServiceError::from_status(reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert_eq!(e.kind, FailureKind::Rejected);
        assert!(e.message.contains("bad key"));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_error_retryable() {
        assert!(!Error::invalid("x").is_retryable());
        assert!(Error::Embedding(ServiceError::timeout("slow")).is_retryable());
        assert!(!Error::Generation(ServiceError::malformed("junk")).is_retryable());
        assert!(!Error::storage("disk full").is_retryable());
        let timed_out = Error::Storage {
            message: "store busy".into(),
            timed_out: true,
        };
        assert!(timed_out.is_retryable());
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(Error::invalid("x").kind(), "invalid_input");
        assert_eq!(
            Error::Embedding(ServiceError::timeout("t")).kind(),
            "embedding_service_error"
        );
        assert_eq!(Error::storage("s").kind(), "storage_error");
    }

    #[test]
    fn test_from_rusqlite() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::Storage { timed_out: false, .. }));
    }

    #[test]
    fn test_interrupted_statement_is_retryable_timeout() {
        let interrupted = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        );
        let err: Error = interrupted.into();
        assert!(matches!(err, Error::Storage { timed_out: true, .. }));
        assert!(err.is_retryable());
    }
}
