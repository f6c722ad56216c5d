//! Connection pooling for benchmark sessions.
//!
//! Provides a bounded pool of physical connections shared by all workers of
//! a run. Acquisition is serialized through a semaphore sized to the
//! profile's `max_open`; idle connections sit behind a mutex that is never
//! held across a network call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::driver::{Connection, Driver, DriverError, QueryOutput};
use crate::error::Error;
use crate::profile::ConnectionProfile;
use crate::value::Value;

/// A physical connection plus the statements prepared on it.
struct PoolEntry<C: Connection> {
    conn: C,
    created_at: Instant,
    statements: HashMap<u64, C::Statement>,
    /// Set while an operation is outstanding; still set on drop means the
    /// operation was cancelled mid-flight and the wire state is unknown.
    in_flight: bool,
    broken: bool,
}

impl<C: Connection> PoolEntry<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            created_at: Instant::now(),
            statements: HashMap::new(),
            in_flight: false,
            broken: false,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|lifetime| self.created_at.elapsed() >= lifetime)
    }

    fn is_reusable(&self, max_lifetime: Option<Duration>) -> bool {
        !self.broken && !self.in_flight && !self.is_expired(max_lifetime)
    }

    fn track<T>(&mut self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        self.in_flight = false;
        if let Err(e) = &result {
            if e.is_connection_lost() {
                self.broken = true;
            }
        }
        result
    }
}

/// Internal pool state.
struct PoolInner<D: Driver> {
    driver: Arc<D>,
    profile: ConnectionProfile,
    idle: Mutex<Vec<PoolEntry<D::Connection>>>,
    semaphore: Arc<Semaphore>,
    open: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicBool,
}

impl<D: Driver> PoolInner<D> {
    fn pop_idle(&self) -> Option<PoolEntry<D::Connection>> {
        let max_lifetime = self.profile.pool().max_lifetime;
        loop {
            let entry = self.idle.lock().pop()?;
            if entry.is_reusable(max_lifetime) {
                return Some(entry);
            }
            tracing::debug!(target = %self.profile.target(), "retiring expired connection");
            self.discard(entry);
        }
    }

    fn return_entry(&self, entry: PoolEntry<D::Connection>) {
        let limits = self.profile.pool();
        if !self.closed.load(Ordering::SeqCst) && entry.is_reusable(limits.max_lifetime) {
            let mut idle = self.idle.lock();
            if idle.len() < limits.max_idle {
                idle.push(entry);
                return;
            }
        }
        // Pool closed, connection unusable, or idle list full
        self.discard(entry);
    }

    fn discard(&self, entry: PoolEntry<D::Connection>) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        if entry.in_flight || entry.broken {
            // Nothing sensible can be said to the server any more
            drop(entry);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = entry.conn.close().await {
                        tracing::debug!(error = %e, "error closing discarded connection");
                    }
                });
            }
            Err(_) => drop(entry),
        }
    }
}

/// A pooled connection that returns itself to the pool when dropped.
pub struct PooledConnection<D: Driver> {
    entry: Option<PoolEntry<D::Connection>>,
    pool: Arc<PoolInner<D>>,
    reused: bool,
    // Released after the entry is back in the idle list.
    _permit: OwnedSemaphorePermit,
}

impl<D: Driver> PooledConnection<D> {
    fn entry_mut(&mut self) -> Result<&mut PoolEntry<D::Connection>, DriverError> {
        self.entry
            .as_mut()
            .ok_or_else(|| DriverError::new("connection is not available"))
    }

    /// Whether this connection was reused from the idle list.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Check whether a statement is already prepared on this connection.
    pub fn is_prepared(&self, key: u64) -> bool {
        self.entry
            .as_ref()
            .is_some_and(|entry| entry.statements.contains_key(&key))
    }

    /// Ping the server.
    pub async fn ping(&mut self) -> Result<(), DriverError> {
        let entry = self.entry_mut()?;
        entry.in_flight = true;
        let result = entry.conn.ping().await;
        entry.track(result)
    }

    /// Run an ad-hoc query.
    pub async fn query(&mut self, sql: &str) -> Result<QueryOutput, DriverError> {
        let entry = self.entry_mut()?;
        entry.in_flight = true;
        let result = entry.conn.query(sql).await;
        entry.track(result)
    }

    /// Prepare `sql` under `key` unless this connection already has it.
    pub async fn prepare(&mut self, key: u64, sql: &str) -> Result<(), DriverError> {
        let entry = self.entry_mut()?;
        if entry.statements.contains_key(&key) {
            return Ok(());
        }
        entry.in_flight = true;
        let result = entry.conn.prepare(sql).await;
        let statement = entry.track(result)?;
        entry.statements.insert(key, statement);
        Ok(())
    }

    /// Execute the statement prepared under `key`.
    pub async fn execute_prepared(
        &mut self,
        key: u64,
        args: &[Value],
    ) -> Result<QueryOutput, DriverError> {
        let entry = self.entry_mut()?;
        let statement = entry
            .statements
            .get(&key)
            .ok_or_else(|| DriverError::new(format!("statement {} is not prepared", key)))?;
        entry.in_flight = true;
        let result = entry.conn.execute(statement, args).await;
        entry.track(result)
    }

    /// Mark the connection unusable so it is closed instead of reused.
    pub fn mark_broken(&mut self) {
        if let Some(entry) = self.entry.as_mut() {
            entry.broken = true;
        }
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.return_entry(entry);
        }
    }
}

/// A bounded pool of connections for one connection profile.
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::new(Arc::new(driver), profile);
/// let mut conn = pool.acquire().await?;
/// conn.ping().await?;
/// drop(conn);
/// pool.close().await;
/// ```
pub struct ConnectionPool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> ConnectionPool<D> {
    /// Create an empty pool; connections are opened on demand.
    pub fn new(driver: Arc<D>, profile: ConnectionProfile) -> Self {
        let semaphore = Arc::new(Semaphore::new(profile.pool().max_open));
        Self {
            inner: Arc::new(PoolInner {
                driver,
                profile,
                idle: Mutex::new(Vec::new()),
                semaphore,
                open: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Acquire a connection, reusing an idle one or opening a new one.
    pub async fn acquire(&self) -> Result<PooledConnection<D>, Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Pool("pool is closed".to_string()));
        }

        // Wait for a permit (limits concurrent connections)
        let acquire_timeout = self.inner.profile.pool().acquire_timeout;
        let permit = tokio::time::timeout(
            acquire_timeout,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| Error::Pool("timeout waiting for connection".to_string()))?
        .map_err(|_| Error::Pool("pool is closed".to_string()))?;

        if let Some(entry) = self.inner.pop_idle() {
            return Ok(PooledConnection {
                entry: Some(entry),
                pool: self.inner.clone(),
                reused: true,
                _permit: permit,
            });
        }

        let profile = &self.inner.profile;
        let conn = tokio::time::timeout(
            profile.connect_timeout(),
            self.inner.driver.connect(profile),
        )
        .await
        .map_err(|_| {
            Error::Connect(format!(
                "timed out connecting to {} after {:?}",
                profile.target(),
                profile.connect_timeout()
            ))
        })?
        .map_err(|e| Error::Connect(format!("{}: {}", profile.target(), e.describe())))?;

        let open = self.inner.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.created.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(target = %profile.target(), open, "opened connection");

        Ok(PooledConnection {
            entry: Some(PoolEntry::new(conn)),
            pool: self.inner.clone(),
            reused: false,
            _permit: permit,
        })
    }

    /// Close all idle connections and refuse further acquisitions.
    ///
    /// Connections still checked out are closed when they are returned.
    /// Calling this more than once is harmless.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();

        let drained: Vec<_> = self.inner.idle.lock().drain(..).collect();
        for entry in drained {
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = entry.conn.close().await {
                tracing::debug!(error = %e, "error closing pooled connection");
            }
        }
    }

    /// Check whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of physical connections currently open (idle or checked out).
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Number of physical connections opened over the pool's lifetime.
    pub fn created_connections(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Number of idle connections.
    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Profile this pool connects with.
    pub fn profile(&self) -> &ConnectionProfile {
        &self.inner.profile
    }

    /// Driver this pool connects through.
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &self.inner.driver.name())
            .field("target", &self.inner.profile.target())
            .field("max_open", &self.inner.profile.pool().max_open)
            .field("open", &self.open_connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    fn profile(max_open: usize, max_idle: usize) -> ConnectionProfile {
        ConnectionProfile::builder("localhost", 3306)
            .user("root")
            .max_open(max_open)
            .max_idle(max_idle)
            .acquire_timeout(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reuses_idle_connection() {
        let pool = ConnectionPool::new(Arc::new(MockDriver::new()), profile(2, 2));

        let conn = pool.acquire().await.unwrap();
        assert!(!conn.is_reused());
        drop(conn);
        assert_eq!(pool.idle_connections(), 1);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(pool.created_connections(), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_at_ceiling() {
        let pool = ConnectionPool::new(Arc::new(MockDriver::new()), profile(1, 1));

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, Error::Pool(_)));
    }

    #[tokio::test]
    async fn test_idle_limit_discards_extra() {
        let driver = Arc::new(MockDriver::new());
        let pool = ConnectionPool::new(driver.clone(), profile(3, 1));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.open_connections(), 2);
        drop(a);
        drop(b);

        assert_eq!(pool.idle_connections(), 1);
        assert_eq!(pool.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let driver = Arc::new(MockDriver::new());
        let pool = ConnectionPool::new(driver.clone(), profile(2, 2));
        drop(pool.acquire().await.unwrap());

        pool.close().await;
        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(pool.open_connections(), 0);
        assert_eq!(driver.live_connections(), 0);
        assert!(matches!(pool.acquire().await, Err(Error::Pool(_))));
    }

    #[tokio::test]
    async fn test_connection_returned_after_close_is_discarded() {
        let pool = ConnectionPool::new(Arc::new(MockDriver::new()), profile(2, 2));
        let conn = pool.acquire().await.unwrap();

        pool.close().await;
        drop(conn);

        assert_eq!(pool.open_connections(), 0);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[tokio::test]
    async fn test_broken_connection_not_reused() {
        let pool = ConnectionPool::new(Arc::new(MockDriver::new()), profile(2, 2));
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);

        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_expired_connection_retired() {
        let profile = ConnectionProfile::builder("localhost", 3306)
            .user("root")
            .max_lifetime(Duration::from_millis(1))
            .build()
            .unwrap();
        let pool = ConnectionPool::new(Arc::new(MockDriver::new()), profile);
        drop(pool.acquire().await.unwrap());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let conn = pool.acquire().await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(pool.created_connections(), 2);
    }

    #[tokio::test]
    async fn test_prepared_statements_cached_per_connection() {
        let driver = Arc::new(MockDriver::new());
        let pool = ConnectionPool::new(driver.clone(), profile(1, 1));

        let mut conn = pool.acquire().await.unwrap();
        conn.prepare(7, "select ?").await.unwrap();
        conn.prepare(7, "select ?").await.unwrap();
        assert!(conn.is_prepared(7));
        assert_eq!(driver.prepare_calls(), 1);
        drop(conn);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_prepared(7));
    }
}
