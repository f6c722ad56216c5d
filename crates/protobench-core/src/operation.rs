//! Operations and the driver that times them.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::driver::{Driver, QueryOutput};
use crate::error::{Error, ErrorKind, Result};
use crate::pool::PooledConnection;
use crate::session::{first_value, PreparedHandle, Session};
use crate::value::Value;

/// One repeatable unit of database work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationSpec {
    /// Ad-hoc query returning a single value.
    ScalarQuery {
        sql: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect: Option<Value>,
    },
    /// Prepared statement executed with bound arguments.
    PreparedQuery {
        sql: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect: Option<Value>,
    },
    /// Ad-hoc query whose rows are all read back.
    MultiRowQuery { sql: String },
    /// Driver-level ping.
    LivenessCheck,
}

impl OperationSpec {
    /// Ad-hoc scalar query.
    pub fn scalar(sql: impl Into<String>) -> Self {
        OperationSpec::ScalarQuery {
            sql: sql.into(),
            expect: None,
        }
    }

    /// Prepared query with bound arguments.
    pub fn prepared(sql: impl Into<String>, args: Vec<Value>) -> Self {
        OperationSpec::PreparedQuery {
            sql: sql.into(),
            args,
            expect: None,
        }
    }

    /// Ad-hoc multi-row query.
    pub fn multi_row(sql: impl Into<String>) -> Self {
        OperationSpec::MultiRowQuery { sql: sql.into() }
    }

    /// Ping.
    pub fn liveness() -> Self {
        OperationSpec::LivenessCheck
    }

    /// Require the first column to match `value`; other variants are unchanged.
    pub fn expecting(self, value: impl Into<Value>) -> Self {
        match self {
            OperationSpec::ScalarQuery { sql, .. } => OperationSpec::ScalarQuery {
                sql,
                expect: Some(value.into()),
            },
            OperationSpec::PreparedQuery { sql, args, .. } => OperationSpec::PreparedQuery {
                sql,
                args,
                expect: Some(value.into()),
            },
            other => other,
        }
    }

    /// Short kind name used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            OperationSpec::ScalarQuery { .. } => "query",
            OperationSpec::PreparedQuery { .. } => "prepared",
            OperationSpec::MultiRowQuery { .. } => "multi_row",
            OperationSpec::LivenessCheck => "ping",
        }
    }

    /// SQL text, if the operation has any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            OperationSpec::ScalarQuery { sql, .. }
            | OperationSpec::PreparedQuery { sql, .. }
            | OperationSpec::MultiRowQuery { sql } => Some(sql),
            OperationSpec::LivenessCheck => None,
        }
    }
}

impl std::fmt::Display for OperationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.sql() {
            Some(sql) => write!(f, "{}: {}", self.kind(), sql),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// Details of a failed sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// One measured operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    duration: Duration,
    failure: Option<SampleFailure>,
}

impl Sample {
    /// A successful sample.
    pub fn success(duration: Duration) -> Self {
        Self {
            duration,
            failure: None,
        }
    }

    /// A failed sample.
    pub fn failure(duration: Duration, error: &Error) -> Self {
        Self {
            duration,
            failure: Some(SampleFailure {
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }

    /// Measured duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether the operation succeeded.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Failure details, if the operation failed.
    pub fn error(&self) -> Option<&SampleFailure> {
        self.failure.as_ref()
    }
}

/// Whether pool acquisition is part of the timed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireTiming {
    /// Time only the round-trip.
    #[default]
    Excluded,
    /// Time acquisition plus the round-trip.
    Included,
}

/// An operation ready to run against a particular session.
///
/// Prepared queries carry the session's statement handle, so the
/// preparation cost is paid once when the operation is bound.
#[derive(Debug, Clone)]
pub enum BoundOperation {
    Scalar {
        sql: String,
        expect: Option<Value>,
    },
    Prepared {
        handle: PreparedHandle,
        args: Vec<Value>,
        expect: Option<Value>,
    },
    MultiRow {
        sql: String,
    },
    Liveness,
}

/// Executes exactly one operation against a session and times it.
///
/// The driver never retries: a failed operation becomes a failed sample.
/// Only errors that make the session unusable (pool exhaustion, refused
/// connects, failed preparation on a fresh connection) are returned as `Err`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationDriver {
    timeout: Option<Duration>,
    acquire_timing: AcquireTiming,
}

impl OperationDriver {
    /// Create a driver with no timeout that excludes acquisition from timing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail operations that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Choose whether acquisition is timed.
    pub fn with_acquire_timing(mut self, timing: AcquireTiming) -> Self {
        self.acquire_timing = timing;
        self
    }

    /// Bind an operation to a session, preparing statements where needed.
    pub async fn bind<D: Driver>(
        &self,
        session: &Session<D>,
        spec: &OperationSpec,
    ) -> Result<BoundOperation> {
        Ok(match spec {
            OperationSpec::ScalarQuery { sql, expect } => BoundOperation::Scalar {
                sql: sql.clone(),
                expect: expect.clone(),
            },
            OperationSpec::PreparedQuery { sql, args, expect } => BoundOperation::Prepared {
                handle: session.prepare_once(sql).await?,
                args: args.clone(),
                expect: expect.clone(),
            },
            OperationSpec::MultiRowQuery { sql } => BoundOperation::MultiRow { sql: sql.clone() },
            OperationSpec::LivenessCheck => BoundOperation::Liveness,
        })
    }

    /// Run one operation and return its sample.
    pub async fn execute<D: Driver>(
        &self,
        session: &Session<D>,
        operation: &BoundOperation,
    ) -> Result<Sample> {
        let acquire_start = Instant::now();
        let mut conn = session.acquire().await?;
        let acquired = match self.acquire_timing {
            AcquireTiming::Excluded => Duration::ZERO,
            AcquireTiming::Included => acquire_start.elapsed(),
        };
        // Preparing on a fresh connection is never part of the sample
        if let BoundOperation::Prepared { handle, .. } = operation {
            session.ensure_prepared(&mut conn, handle).await?;
        }

        let start = Instant::now();
        let outcome = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, run_once(&mut conn, operation)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Timeout(limit)),
                }
            }
            None => run_once(&mut conn, operation).await,
        };
        let elapsed = acquired + start.elapsed();

        Ok(match outcome {
            Ok(()) => Sample::success(elapsed),
            Err(e) => Sample::failure(elapsed, &e),
        })
    }
}

async fn run_once<D: Driver>(
    conn: &mut PooledConnection<D>,
    operation: &BoundOperation,
) -> Result<()> {
    match operation {
        BoundOperation::Scalar { sql, expect } => {
            let output = conn.query(sql).await.map_err(|e| Error::Query(e.describe()))?;
            check_expected(output, expect.as_ref())
        }
        BoundOperation::Prepared {
            handle,
            args,
            expect,
        } => {
            let output = conn
                .execute_prepared(handle.id(), args)
                .await
                .map_err(|e| Error::Query(e.describe()))?;
            check_expected(output, expect.as_ref())
        }
        BoundOperation::MultiRow { sql } => {
            conn.query(sql).await.map_err(|e| Error::Query(e.describe()))?;
            Ok(())
        }
        BoundOperation::Liveness => conn.ping().await.map_err(|e| Error::Query(e.describe())),
    }
}

fn check_expected(output: QueryOutput, expect: Option<&Value>) -> Result<()> {
    let value = first_value(output)?;
    match expect {
        Some(expected) if !value.matches(expected) => Err(Error::Query(format!(
            "expected {}, got {}",
            expected, value
        ))),
        _ => Ok(()),
    }
}
