//! Benchmark sessions.
//!
//! A [`Session`] is the live handle for one connection profile: it owns the
//! connection pool, checks liveness before handing itself out, and exposes
//! the ad-hoc and prepared execution paths the operation driver measures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::driver::{Driver, QueryOutput};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::profile::ConnectionProfile;
use crate::value::Value;

/// A statement prepared once per session and reusable across executions.
///
/// The handle is only an identifier plus SQL text: each physical connection
/// prepares the statement the first time it executes it, outside the timed
/// window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedHandle {
    id: u64,
    sql: Arc<str>,
}

impl PreparedHandle {
    /// Session-local statement identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Statement SQL.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// A live, pooled handle bound to one connection profile.
///
/// # Example
///
/// ```ignore
/// let session = Session::open(Arc::new(driver), profile).await?;
/// let (value, elapsed) = session.execute_scalar("select 1").await?;
/// session.close().await;
/// ```
pub struct Session<D: Driver> {
    pool: ConnectionPool<D>,
    next_statement: AtomicU64,
    closed: AtomicBool,
}

impl<D: Driver> Session<D> {
    /// Open a session and verify the server answers a ping.
    ///
    /// The connection used for the liveness check stays in the pool, so the
    /// first timed operation does not pay for connection setup.
    pub async fn open(driver: Arc<D>, profile: ConnectionProfile) -> Result<Self> {
        let pool = ConnectionPool::new(driver, profile);

        let ping = async {
            let mut conn = pool.acquire().await?;
            conn.ping().await.map_err(|e| {
                conn.mark_broken();
                Error::Connect(format!(
                    "liveness check against {} failed: {}",
                    pool.profile().target(),
                    e.describe()
                ))
            })
        };
        if let Err(e) = ping.await {
            pool.close().await;
            return Err(match e {
                Error::Pool(msg) => Error::Connect(msg),
                other => other,
            });
        }

        tracing::info!(
            driver = pool.driver().name(),
            target = %pool.profile().target(),
            compression = pool.profile().compression(),
            max_open = pool.profile().pool().max_open,
            "session opened"
        );

        Ok(Self {
            pool,
            next_statement: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Profile this session was opened with.
    pub fn profile(&self) -> &ConnectionProfile {
        self.pool.profile()
    }

    /// Name of the driver behind this session.
    pub fn driver_name(&self) -> &str {
        self.pool.driver().name()
    }

    /// Acquire a pooled connection.
    ///
    /// Timeouts and refused connects surface as [`Error::Pool`] and
    /// [`Error::Connect`]; both are fatal to a run.
    pub async fn acquire(&self) -> Result<PooledConnection<D>> {
        self.pool.acquire().await
    }

    /// Run an ad-hoc query and return its first column with the query's duration.
    ///
    /// The duration excludes pool acquisition.
    pub async fn execute_scalar(&self, sql: &str) -> Result<(Value, Duration)> {
        let mut conn = self.acquire().await?;
        let start = Instant::now();
        let output = conn
            .query(sql)
            .await
            .map_err(|e| Error::Query(e.describe()))?;
        let elapsed = start.elapsed();
        Ok((first_value(output)?, elapsed))
    }

    /// Prepare a statement once for this session.
    ///
    /// The statement is prepared on one connection immediately so syntax
    /// errors surface here; other connections prepare it lazily.
    pub async fn prepare_once(&self, sql: &str) -> Result<PreparedHandle> {
        let handle = PreparedHandle {
            id: self.next_statement.fetch_add(1, Ordering::SeqCst),
            sql: Arc::from(sql),
        };
        let mut conn = self.acquire().await?;
        self.ensure_prepared(&mut conn, &handle).await?;
        tracing::debug!(statement = handle.id, sql, "statement prepared");
        Ok(handle)
    }

    /// Make sure `handle` is prepared on `conn`.
    pub async fn ensure_prepared(
        &self,
        conn: &mut PooledConnection<D>,
        handle: &PreparedHandle,
    ) -> Result<()> {
        conn.prepare(handle.id, &handle.sql)
            .await
            .map_err(|e| Error::Prepare(format!("'{}': {}", handle.sql, e.describe())))
    }

    /// Execute a prepared statement and return its first column with the execution time.
    ///
    /// Preparing on a fresh connection happens before the clock starts.
    pub async fn execute_bound(
        &self,
        handle: &PreparedHandle,
        args: &[Value],
    ) -> Result<(Value, Duration)> {
        let mut conn = self.acquire().await?;
        self.ensure_prepared(&mut conn, handle).await?;
        let start = Instant::now();
        let output = conn
            .execute_prepared(handle.id, args)
            .await
            .map_err(|e| Error::Query(e.describe()))?;
        let elapsed = start.elapsed();
        Ok((first_value(output)?, elapsed))
    }

    /// Ping the server through the pool.
    pub async fn ping(&self) -> Result<Duration> {
        let mut conn = self.acquire().await?;
        let start = Instant::now();
        conn.ping()
            .await
            .map_err(|e| Error::Query(e.describe()))?;
        Ok(start.elapsed())
    }

    /// Close every pooled connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close().await;
        tracing::info!(
            target = %self.pool.profile().target(),
            connections = self.pool.created_connections(),
            "session closed"
        );
    }

    /// Check whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Physical connections currently open.
    pub fn open_connections(&self) -> usize {
        self.pool.open_connections()
    }

    /// Physical connections opened over the session's lifetime.
    pub fn created_connections(&self) -> usize {
        self.pool.created_connections()
    }
}

impl<D: Driver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pool", &self.pool)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn first_value(output: QueryOutput) -> Result<Value> {
    if output.rows == 0 {
        return Err(Error::Query("query returned no rows".to_string()));
    }
    Ok(output.scalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    fn profile() -> ConnectionProfile {
        ConnectionProfile::builder("localhost", 3306)
            .user("root")
            .password("let-me-in")
            .max_open(2)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_pings_and_keeps_connection() {
        let driver = Arc::new(MockDriver::new());
        let session = Session::open(driver.clone(), profile()).await.unwrap();

        assert_eq!(driver.pings(), 1);
        assert_eq!(session.open_connections(), 1);

        let (value, _) = session.execute_scalar("select 1").await.unwrap();
        assert_eq!(value, Value::Int(1));
        // Reused the connection from the liveness check
        assert_eq!(driver.connects(), 1);
    }

    #[tokio::test]
    async fn test_open_then_close_leaks_nothing() {
        let driver = Arc::new(MockDriver::new());
        let session = Session::open(driver.clone(), profile()).await.unwrap();

        session.close().await;
        session.close().await;

        assert!(session.is_closed());
        assert_eq!(session.open_connections(), 0);
        assert_eq!(driver.live_connections(), 0);
        assert_eq!(driver.query_calls(), 0);
    }

    #[tokio::test]
    async fn test_open_fails_on_connect() {
        let driver = Arc::new(MockDriver::new().fail_connect());
        let err = Session::open(driver, profile()).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn test_open_fails_on_ping() {
        let driver = Arc::new(MockDriver::new().fail_ping());
        let err = Session::open(driver.clone(), profile()).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        assert_eq!(driver.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_prepare_once_and_execute_bound() {
        let driver = Arc::new(MockDriver::new().with_scalar(123));
        let session = Session::open(driver.clone(), profile()).await.unwrap();

        let handle = session.prepare_once("select ? as id").await.unwrap();
        for _ in 0..5 {
            let (value, _) = session
                .execute_bound(&handle, &[Value::Int(123)])
                .await
                .unwrap();
            assert_eq!(value, Value::Int(123));
        }
        // Sequential use keeps to one connection, so one prepare
        assert_eq!(driver.prepare_calls(), 1);
    }

    #[tokio::test]
    async fn test_prepare_failure() {
        let driver = Arc::new(MockDriver::new().fail_prepare());
        let session = Session::open(driver, profile()).await.unwrap();
        let err = session.prepare_once("select from").await.unwrap_err();
        assert!(matches!(err, Error::Prepare(_)));
    }

    #[tokio::test]
    async fn test_scalar_without_rows_is_query_failure() {
        let driver = Arc::new(MockDriver::new().with_rows(0));
        let session = Session::open(driver, profile()).await.unwrap();
        let err = session.execute_scalar("select 1 where false").await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }
}
