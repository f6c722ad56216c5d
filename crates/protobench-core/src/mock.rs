//! In-process driver for dry runs and tests.
//!
//! [`MockDriver`] answers every query with a configurable scalar after a
//! configurable delay, and can be told to fail connects, prepares, pings or
//! individual query calls. It also keeps the counters the harness tests need
//! to prove connections are not leaked and pool ceilings hold.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::driver::{Connection, Driver, DriverError, QueryOutput};
use crate::profile::ConnectionProfile;
use crate::value::Value;

#[derive(Default)]
struct MockState {
    latency_ns: AtomicU64,
    jitter_ns: AtomicU64,
    scalar: Mutex<Value>,
    rows: AtomicU64,
    fail_connect: AtomicBool,
    connect_limit: AtomicU64,
    fail_ping: AtomicBool,
    fail_prepare: AtomicBool,
    failing_calls: Mutex<HashSet<u64>>,
    hanging_calls: Mutex<HashSet<u64>>,
    dropping_calls: Mutex<HashSet<u64>>,
    calls: AtomicU64,
    connects: AtomicU64,
    pings: AtomicU64,
    prepares: AtomicU64,
    live: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockState {
    async fn simulate_round_trip(&self) {
        let mut delay = Duration::from_nanos(self.latency_ns.load(Ordering::Relaxed));
        let jitter = self.jitter_ns.load(Ordering::Relaxed);
        if jitter > 0 {
            let extra = rand::thread_rng().gen_range(0..=jitter);
            delay += Duration::from_nanos(extra);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_call(&self) -> Result<QueryOutput, DriverError> {
        // 1-based so that "fail call 50" means the fiftieth query
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if self.hanging_calls.lock().contains(&call) {
            std::future::pending::<()>().await;
        }
        self.simulate_round_trip().await;

        if self.failing_calls.lock().contains(&call) {
            return Err(DriverError::new(format!("injected failure on call {}", call)));
        }
        if self.dropping_calls.lock().contains(&call) {
            return Err(DriverError::connection_lost(format!(
                "connection reset on call {}",
                call
            )));
        }
        let rows = self.rows.load(Ordering::Relaxed);
        let scalar = if rows == 0 {
            Value::Null
        } else {
            self.scalar.lock().clone()
        };
        Ok(QueryOutput { rows, scalar })
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process driver with injectable latency and failures.
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    /// Create a driver answering every query with `1` and no delay.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                scalar: Mutex::new(Value::Int(1)),
                rows: AtomicU64::new(1),
                connect_limit: AtomicU64::new(u64::MAX),
                ..MockState::default()
            }),
        }
    }

    /// Set the simulated round-trip latency.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state
            .latency_ns
            .store(latency.as_nanos() as u64, Ordering::Relaxed);
        self
    }

    /// Add up to `jitter` of random extra latency per call.
    pub fn with_jitter(self, jitter: Duration) -> Self {
        self.state
            .jitter_ns
            .store(jitter.as_nanos() as u64, Ordering::Relaxed);
        self
    }

    /// Set the scalar every query returns.
    pub fn with_scalar(self, value: impl Into<Value>) -> Self {
        *self.state.scalar.lock() = value.into();
        self
    }

    /// Set the number of rows every query returns.
    pub fn with_rows(self, rows: u64) -> Self {
        self.state.rows.store(rows, Ordering::Relaxed);
        self
    }

    /// Make every connect attempt fail.
    pub fn fail_connect(self) -> Self {
        self.state.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    /// Make every ping fail.
    pub fn fail_ping(self) -> Self {
        self.state.fail_ping.store(true, Ordering::SeqCst);
        self
    }

    /// Make every prepare fail.
    pub fn fail_prepare(self) -> Self {
        self.state.fail_prepare.store(true, Ordering::SeqCst);
        self
    }

    /// Fail the `call`-th query or execute (1-based, counted across connections).
    pub fn fail_call(self, call: u64) -> Self {
        self.state.failing_calls.lock().insert(call);
        self
    }

    /// Never complete the `call`-th query or execute.
    pub fn hang_call(self, call: u64) -> Self {
        self.state.hanging_calls.lock().insert(call);
        self
    }

    /// Refuse every connect after the first `connects` successful ones.
    pub fn fail_connects_after(self, connects: u64) -> Self {
        self.state.connect_limit.store(connects, Ordering::SeqCst);
        self
    }

    /// Lose the connection on the `call`-th query or execute.
    pub fn drop_connection_on_call(self, call: u64) -> Self {
        self.state.dropping_calls.lock().insert(call);
        self
    }

    /// Query and execute calls issued so far.
    pub fn query_calls(&self) -> u64 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Pings so far.
    pub fn pings(&self) -> u64 {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Prepares so far.
    pub fn prepare_calls(&self) -> u64 {
        self.state.prepares.load(Ordering::SeqCst)
    }

    /// Connections currently alive (not yet closed or dropped).
    pub fn live_connections(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously outstanding query calls.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field(
                "latency",
                &Duration::from_nanos(self.state.latency_ns.load(Ordering::Relaxed)),
            )
            .field("live", &self.live_connections())
            .finish()
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = MockConnection;

    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, profile: &ConnectionProfile) -> Result<MockConnection, DriverError> {
        let refused = self.state.fail_connect.load(Ordering::SeqCst)
            || self.state.connects.load(Ordering::SeqCst)
                >= self.state.connect_limit.load(Ordering::SeqCst);
        if refused {
            return Err(DriverError::connection_lost(format!(
                "connection refused by {}",
                profile.target()
            )));
        }
        self.state.simulate_round_trip().await;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            state: self.state.clone(),
        })
    }
}

/// Connection produced by [`MockDriver`].
pub struct MockConnection {
    state: Arc<MockState>,
}

/// Statement prepared on a [`MockConnection`].
#[derive(Debug, Clone)]
pub struct MockStatement {
    pub sql: String,
}

#[async_trait]
impl Connection for MockConnection {
    type Statement = MockStatement;

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_ping.load(Ordering::SeqCst) {
            return Err(DriverError::connection_lost("ping failed"));
        }
        self.state.simulate_round_trip().await;
        Ok(())
    }

    async fn query(&mut self, _sql: &str) -> Result<QueryOutput, DriverError> {
        self.state.run_call().await
    }

    async fn prepare(&mut self, sql: &str) -> Result<MockStatement, DriverError> {
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_prepare.load(Ordering::SeqCst) {
            return Err(DriverError::new("syntax error in prepared statement").with_code("42000"));
        }
        self.state.simulate_round_trip().await;
        Ok(MockStatement {
            sql: sql.to_string(),
        })
    }

    async fn execute(
        &mut self,
        _statement: &MockStatement,
        _args: &[Value],
    ) -> Result<QueryOutput, DriverError> {
        self.state.run_call().await
    }

    async fn close(self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ConnectionProfile {
        ConnectionProfile::builder("localhost", 3306)
            .user("root")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_injected_failure_hits_exact_call() {
        let driver = MockDriver::new().fail_call(2);
        let mut conn = driver.connect(&profile()).await.unwrap();

        assert!(conn.query("select 1").await.is_ok());
        assert!(conn.query("select 1").await.is_err());
        assert!(conn.query("select 1").await.is_ok());
        assert_eq!(driver.query_calls(), 3);
    }

    #[tokio::test]
    async fn test_live_connection_tracking() {
        let driver = MockDriver::new();
        let conn = driver.connect(&profile()).await.unwrap();
        assert_eq!(driver.live_connections(), 1);

        conn.close().await.unwrap();
        assert_eq!(driver.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let driver = MockDriver::new().fail_connect();
        let err = driver.connect(&profile()).await.err().unwrap();
        assert!(err.is_connection_lost());
        assert_eq!(driver.connects(), 0);
    }

    #[tokio::test]
    async fn test_connect_limit_and_dropped_connection() {
        let driver = MockDriver::new()
            .fail_connects_after(1)
            .drop_connection_on_call(1);
        let mut conn = driver.connect(&profile()).await.unwrap();

        let err = conn.query("select 1").await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(driver.connect(&profile()).await.is_err());
        assert_eq!(driver.connects(), 1);
    }

    #[tokio::test]
    async fn test_zero_rows_yield_null() {
        let driver = MockDriver::new().with_rows(0);
        let mut conn = driver.connect(&profile()).await.unwrap();
        let out = conn.query("select 1 where false").await.unwrap();
        assert_eq!(out.rows, 0);
        assert!(out.scalar.is_null());
    }
}
