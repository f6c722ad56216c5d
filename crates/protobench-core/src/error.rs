//! Benchmark error types.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Benchmark errors.
///
/// Variants map onto the failure taxonomy of a benchmark run: profile and
/// configuration errors are raised before anything touches the network,
/// connection and prepare errors end the run that hit them, and query
/// errors (including timeouts) are recorded as failed samples.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Connection profile failed validation.
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// Run or comparator configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Connection could not be established or failed its liveness check.
    #[error("connection error: {0}")]
    Connect(String),

    /// Statement preparation failed.
    #[error("prepare error: {0}")]
    Prepare(String),

    /// A single operation failed.
    #[error("query error: {0}")]
    Query(String),

    /// A single operation exceeded its timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Pool acquisition failed.
    #[error("pool error: {0}")]
    Pool(String),

    /// A worker task ended abnormally.
    #[error("worker error: {0}")]
    Worker(String),

    /// The run was cancelled before any samples were collected.
    #[error("run cancelled before any samples were collected")]
    Cancelled,

    /// Results cannot be compared fairly.
    #[error("comparison error: {0}")]
    Comparison(String),
}

/// Coarse classification of an [`Error`], carried by failed samples and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidProfile,
    InvalidConfig,
    Connect,
    Prepare,
    Query,
    Timeout,
    Pool,
    Worker,
    Cancelled,
    Comparison,
}

impl Error {
    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidProfile(_) => ErrorKind::InvalidProfile,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Connect(_) => ErrorKind::Connect,
            Error::Prepare(_) => ErrorKind::Prepare,
            Error::Query(_) => ErrorKind::Query,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Pool(_) => ErrorKind::Pool,
            Error::Worker(_) => ErrorKind::Worker,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Comparison(_) => ErrorKind::Comparison,
        }
    }

    /// Whether this error is recorded as a failed sample rather than ending the run.
    pub fn is_query_failure(&self) -> bool {
        matches!(self, Error::Query(_) | Error::Timeout(_))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidProfile => "invalid_profile",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Connect => "connect",
            ErrorKind::Prepare => "prepare",
            ErrorKind::Query => "query",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Pool => "pool",
            ErrorKind::Worker => "worker",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Comparison => "comparison",
        };
        f.write_str(name)
    }
}

/// Result alias for benchmark operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_failures() {
        assert!(Error::Query("boom".into()).is_query_failure());
        assert!(Error::Timeout(Duration::from_millis(5)).is_query_failure());
        assert!(!Error::Connect("refused".into()).is_query_failure());
        assert!(!Error::Prepare("syntax".into()).is_query_failure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidProfile("host must not be empty".into());
        assert_eq!(err.to_string(), "invalid profile: host must not be empty");
        assert_eq!(err.kind(), ErrorKind::InvalidProfile);
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
    }
}
