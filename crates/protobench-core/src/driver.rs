//! Driver abstraction.
//!
//! The harness only needs a narrow slice of a database client: connect,
//! ping, run an ad-hoc query, prepare a statement and execute it with bound
//! arguments. Any SQL transport that can do those five things plugs in by
//! implementing [`Driver`] and [`Connection`].

use async_trait::async_trait;
use thiserror::Error;

use crate::profile::ConnectionProfile;
use crate::value::Value;

/// Error reported by a driver.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    code: Option<String>,
    connection_lost: bool,
}

impl DriverError {
    /// Create a driver error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            connection_lost: false,
        }
    }

    /// Create an error for a connection that can no longer be used.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self {
            connection_lost: true,
            ..Self::new(message)
        }
    }

    /// Attach a server error code (SQLSTATE or vendor code).
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Server error code, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Whether the connection that produced this error must be discarded.
    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost
    }

    /// Message including the server code, if present.
    pub(crate) fn describe(&self) -> String {
        match &self.code {
            Some(code) => format!("{} (code {})", self.message, code),
            None => self.message.clone(),
        }
    }
}

/// Outcome of a query: number of rows and the first column of the first row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryOutput {
    /// Rows returned.
    pub rows: u64,
    /// First column of the first row, `Null` when there are no rows.
    pub scalar: Value,
}

impl QueryOutput {
    /// Output of a query returning a single value.
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self {
            rows: 1,
            scalar: value.into(),
        }
    }

    /// Output of a query returning no rows.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// A physical connection opened by a [`Driver`].
#[async_trait]
pub trait Connection: Send + 'static {
    /// Prepared statement handle, valid only on the connection that created it.
    type Statement: Send + Sync + 'static;

    /// Round-trip liveness check.
    async fn ping(&mut self) -> Result<(), DriverError>;

    /// Run an ad-hoc query through the driver's unprepared path.
    async fn query(&mut self, sql: &str) -> Result<QueryOutput, DriverError>;

    /// Prepare a statement on this connection.
    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, DriverError>;

    /// Execute a prepared statement with bound arguments.
    async fn execute(
        &mut self,
        statement: &Self::Statement,
        args: &[Value],
    ) -> Result<QueryOutput, DriverError>;

    /// Close the connection gracefully.
    async fn close(self) -> Result<(), DriverError>;
}

/// Factory for connections to one kind of database.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Connection type produced by this driver.
    type Connection: Connection;

    /// Short driver name used in reports (e.g. `postgres`).
    fn name(&self) -> &str;

    /// Open a physical connection described by the profile.
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Self::Connection, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_describe() {
        let err = DriverError::new("relation \"products\" does not exist").with_code("42P01");
        assert_eq!(err.code(), Some("42P01"));
        assert_eq!(
            err.describe(),
            "relation \"products\" does not exist (code 42P01)"
        );
        assert!(!err.is_connection_lost());
        assert!(DriverError::connection_lost("broken pipe").is_connection_lost());
    }
}
