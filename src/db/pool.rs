//! Connection pool wrapper
//!
//! A thin layer over `bb8` that adds what the process needs on top of
//! plain pooling: a close-once lifecycle that drains in-flight work, a
//! configurable wait-queue policy, and [`Lease`], the RAII handle through
//! which every database operation borrows its connection.

use crate::config::{DatabaseConfig, PoolConfig};
use crate::db::connection_manager::{MySqlConnectionConfig, MySqlConnectionManager};
use crate::db::error::{DbError, DbResult, sql_preview};
use crate::db::session::{Driver, Row, Session};
use bb8::{Pool, PooledConnection, RunError};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, instrument, warn};

/// Upper bound on checking out one idle connection while closing
const CLOSE_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pool statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live connections, idle or borrowed
    pub size: u32,
    pub idle: u32,
    /// Connections currently borrowed by an operation
    pub active: u32,
    pub max_size: u32,
    /// Callers currently queued for a connection
    pub waiting: usize,
}

impl PoolStats {
    pub fn utilization_percent(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.active as f64 / self.max_size as f64) * 100.0
        }
    }
}

/// Process-wide pool of database connections
///
/// Cloning is cheap and every clone refers to the same pool. The pool is
/// built once by the process entry point and closed once at shutdown.
pub struct ConnectionPool<M: Driver = MySqlConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

struct PoolInner<M: Driver> {
    /// `None` once closed. Every lease holds a read guard, so taking the
    /// write lock waits for in-flight operations to finish.
    lifecycle: Arc<RwLock<Option<Pool<M>>>>,
    config: PoolConfig,
    waiting: AtomicUsize,
}

impl<M: Driver> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Driver> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("waiting", &self.inner.waiting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionPool<MySqlConnectionManager> {
    /// Create the MySQL pool from validated configuration
    ///
    /// Fails with [`DbError::Config`] when a required setting is empty or
    /// the CA certificate cannot be read. Connections are opened lazily.
    #[instrument(skip_all, fields(host = %database.host, database = %database.database))]
    pub fn connect(database: &DatabaseConfig, pool_config: PoolConfig) -> DbResult<Self> {
        let connection_config = MySqlConnectionConfig::from_database_config(database)?;
        Self::new(MySqlConnectionManager::new(connection_config), pool_config)
    }
}

impl<M: Driver> ConnectionPool<M> {
    /// Create a pool around any connection manager
    ///
    /// Must be called from within a Tokio runtime; `bb8` spawns its idle
    /// reaper and `min_idle` replenishment tasks here.
    pub fn new(manager: M, config: PoolConfig) -> DbResult<Self> {
        config.validate()?;

        info!(
            "Creating connection pool with max_size: {}, acquire_timeout: {:?}, queue_limit: {}",
            config.max_size,
            config.acquire_timeout(),
            config.queue_limit
        );

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(config.min_idle)
            .connection_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout_secs.map(Duration::from_secs))
            .max_lifetime(config.max_lifetime_secs.map(Duration::from_secs))
            .test_on_check_out(config.test_on_check_out)
            .build_unchecked(manager);

        Ok(Self {
            inner: Arc::new(PoolInner {
                lifecycle: Arc::new(RwLock::new(Some(pool))),
                config,
                waiting: AtomicUsize::new(0),
            }),
        })
    }

    pub fn builder(manager: M) -> ConnectionPoolBuilder<M> {
        ConnectionPoolBuilder::new(manager)
    }

    /// Check out one connection for manual lifecycle control
    ///
    /// The connection goes back to the pool when the returned [`Lease`]
    /// is dropped, on every exit path. Waits for a free connection up to
    /// the configured acquire timeout without blocking other tasks.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> DbResult<Lease<M>> {
        // A pending or completed close() holds the write side
        let open = Arc::clone(&self.inner.lifecycle)
            .try_read_owned()
            .map_err(|_| DbError::AlreadyClosed)?;
        let pool = open.as_ref().ok_or(DbError::AlreadyClosed)?.clone();

        self.enforce_queue_limit(&pool)?;

        let started = Instant::now();
        let conn = {
            let _queued = WaitSlot::enter(&self.inner.waiting);
            pool.get_owned().await
        };

        match conn {
            Ok(conn) => {
                debug!("Acquired connection after {:?}", started.elapsed());
                Ok(Lease { conn, _open: open })
            }
            Err(RunError::TimedOut) => Err(DbError::PoolExhausted {
                waited: started.elapsed(),
            }),
            Err(RunError::User(e)) => Err(DbError::Connection(Box::new(e))),
        }
    }

    /// Scoped acquisition: borrow a connection for the duration of `f`
    pub async fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Lease<M>) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let mut lease = self.acquire().await?;
        f(&mut lease).await
    }

    /// Run one parameterized statement on a pooled connection
    ///
    /// The connection is released whether or not the statement succeeds.
    #[instrument(skip(self, params), fields(sql = %sql_preview(sql), params = params.len()))]
    pub async fn query(&self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        let mut lease = self.acquire().await?;
        lease.query(sql, params).await
    }

    /// Run `SELECT 1` and report whether exactly one row came back
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> bool {
        let result = self
            .with_connection(|conn| Box::pin(async move { conn.query("SELECT 1", &[]).await }))
            .await;

        match result {
            Ok(rows) if rows.len() == 1 => true,
            Ok(rows) => {
                warn!("Health check returned {} rows", rows.len());
                false
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
                false
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let max_size = self.inner.config.max_size;
        let waiting = self.inner.waiting.load(Ordering::Relaxed);

        match self.inner.lifecycle.try_read() {
            Ok(open) => match open.as_ref() {
                Some(pool) => {
                    let state = pool.state();
                    PoolStats {
                        size: state.connections,
                        idle: state.idle_connections,
                        active: state.connections.saturating_sub(state.idle_connections),
                        max_size,
                        waiting,
                    }
                }
                None => PoolStats {
                    size: 0,
                    idle: 0,
                    active: 0,
                    max_size,
                    waiting,
                },
            },
            // close() in progress
            Err(_) => PoolStats {
                size: 0,
                idle: 0,
                active: 0,
                max_size,
                waiting,
            },
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// True once `close` has started
    pub fn is_closed(&self) -> bool {
        match self.inner.lifecycle.try_read() {
            Ok(open) => open.is_none(),
            Err(_) => true,
        }
    }

    /// Drain and close the pool
    ///
    /// New checkouts fail with [`DbError::AlreadyClosed`] as soon as this
    /// starts; it then waits for every outstanding [`Lease`] to be dropped
    /// and ends each idle connection with the server. Calling it twice is
    /// an error. The pool stays closed even when ending a connection fails.
    #[instrument(skip(self))]
    pub async fn close(&self) -> DbResult<()> {
        let mut open = self.inner.lifecycle.write().await;
        let pool = open.take().ok_or(DbError::AlreadyClosed)?;

        let state = pool.state();
        info!(
            "Closing connection pool ({} connections, {} idle)",
            state.connections, state.idle_connections
        );
        let closed = close_idle(&pool, state.idle_connections).await;
        drop(pool);

        closed?;
        info!("Connection pool closed");
        Ok(())
    }

    fn enforce_queue_limit(&self, pool: &Pool<M>) -> DbResult<()> {
        let limit = self.inner.config.queue_limit;
        if limit == 0 {
            return Ok(());
        }

        let state = pool.state();
        let saturated =
            state.idle_connections == 0 && state.connections >= self.inner.config.max_size;
        if saturated && self.inner.waiting.load(Ordering::Acquire) >= limit {
            debug!("Wait queue full ({} waiting), failing fast", limit);
            return Err(DbError::PoolExhausted {
                waited: Duration::ZERO,
            });
        }
        Ok(())
    }
}

/// Check out every idle connection at once, end each one, then let `bb8`
/// discard them as broken
async fn close_idle<M: Driver>(pool: &Pool<M>, idle: u32) -> DbResult<()> {
    let mut checked_out = Vec::with_capacity(idle as usize);
    for _ in 0..idle {
        match tokio::time::timeout(CLOSE_CHECKOUT_TIMEOUT, pool.get()).await {
            Ok(Ok(conn)) => checked_out.push(conn),
            Ok(Err(e)) => {
                debug!("Idle connection unavailable while closing: {}", e);
                break;
            }
            Err(_) => {
                debug!("Timed out checking out idle connection while closing");
                break;
            }
        }
    }

    let mut failed = 0;
    let mut first_error = None;
    for conn in checked_out.iter_mut() {
        if let Err(e) = conn.close().await {
            debug!("Failed to close connection: {}", e);
            failed += 1;
            first_error.get_or_insert(e);
        }
    }
    drop(checked_out);

    match first_error {
        Some(source) => Err(DbError::Close { failed, source }),
        None => Ok(()),
    }
}

/// Counts a caller as queued for as long as it is waiting in `bb8`,
/// including when the waiting future is dropped.
struct WaitSlot<'a>(&'a AtomicUsize);

impl<'a> WaitSlot<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection borrowed from the pool
///
/// Exclusive to one logical operation; `&mut` access guarantees no two
/// operations interleave on it. Dropping the lease returns the connection.
pub struct Lease<M: Driver> {
    // Field order matters: the connection is returned before the lifecycle
    // guard is released, so close() never races a returning connection.
    conn: PooledConnection<'static, M>,
    _open: OwnedRwLockReadGuard<Option<Pool<M>>>,
}

impl<M: Driver> Lease<M> {
    /// Run one parameterized statement on this connection
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        self.conn
            .execute(sql, params)
            .await
            .map_err(|source| DbError::query(sql, source))
    }

    pub fn in_transaction(&self) -> bool {
        self.conn.in_transaction()
    }
}

impl<M: Driver> Deref for Lease<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<M: Driver> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl<M: Driver> fmt::Debug for Lease<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

/// Builder for pools in tests and embedded setups
pub struct ConnectionPoolBuilder<M: Driver> {
    manager: M,
    config: PoolConfig,
}

impl<M: Driver> ConnectionPoolBuilder<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            config: PoolConfig::default(),
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_size(mut self, max_size: u32) -> Self {
        self.config.max_size = max_size;
        self
    }

    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.config.min_idle = Some(min_idle);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn queue_limit(mut self, queue_limit: usize) -> Self {
        self.config.queue_limit = queue_limit;
        self
    }

    pub fn build(self) -> DbResult<ConnectionPool<M>> {
        ConnectionPool::new(self.manager, self.config)
    }
}
