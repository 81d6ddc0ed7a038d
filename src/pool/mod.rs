/// Connection pool manager with failure backoff
///
/// The pool is created lazily on the first acquisition and torn down after
/// repeated failures. Every connection handed out has just passed a `SELECT 1`
/// probe. Connection slots are a semaphore of `max_size` permits that outlives
/// pool generations, so a rebuild never pushes the live count past the maximum.

pub mod postgres;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::query::Row;

pub use postgres::{PgConnector, PgSession};

/// Consecutive failures after which the current pool generation is discarded.
const TEARDOWN_AFTER: u32 = 2;

// ---------------------------------------------------------------------------
// Driver seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// Server reported an error with a SQLSTATE
    Database,
    Io,
    Tls,
    Protocol,
    /// Driver-side timeout (connect or client deadline)
    Timeout,
    Other,
}

/// An error as surfaced by the database driver, message already redacted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// SQLSTATE for `Database` errors
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        DriverError {
            kind,
            code: None,
            message: crate::query::sql::redact(&message.into()),
        }
    }

    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError {
            code: Some(code.into()),
            ..DriverError::new(DriverErrorKind::Database, message)
        }
    }
}

/// One physical database session.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Run a statement and return its rows in select-list order.
    async fn fetch(&mut self, sql: &str) -> Result<Vec<Row>, DriverError>;

    /// Apply per-statement server timeouts for subsequent statements.
    async fn set_timeouts(&mut self, statement_timeout: Duration, lock_timeout: Duration) -> Result<(), DriverError> {
        self.fetch(&format!(
            "SET statement_timeout = {}; SET lock_timeout = {}",
            statement_timeout.as_millis(),
            lock_timeout.as_millis()
        ))
        .await
        .map(|_| ())
    }

    async fn probe(&mut self) -> Result<(), DriverError> {
        self.fetch("SELECT 1").await.map(|_| ())
    }

    /// Graceful shutdown of the session.
    async fn close(self) -> Result<(), DriverError>
    where
        Self: Sized;
}

/// Opens new sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self) -> Result<Self::Conn, DriverError>;

    /// Connection target for logs, credentials redacted.
    fn describe(&self) -> String {
        "database".to_string()
    }
}

// ---------------------------------------------------------------------------
// Errors and stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool exhausted: no connection free after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("connection pool in backoff after {failures} consecutive failures, retry in {}s", .retry_after.as_secs().max(1))]
    PoolInBackoff { failures: u32, retry_after: Duration },

    #[error("failed to connect: {0}")]
    ConnectFailed(DriverError),

    #[error("connection pool is closed")]
    PoolClosed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub target: String,
    pub exists: bool,
    pub closed: bool,
    pub generation: u64,
    /// Physical connections alive, idle or checked out
    pub open: usize,
    pub idle: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub in_backoff: bool,
    pub retry_after_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Connection handles
// ---------------------------------------------------------------------------

/// Counts one physical connection while it exists.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        LiveGuard(counter.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Tracked<T> {
    conn: T,
    _live: LiveGuard,
}

impl<T: Connection> Tracked<T> {
    async fn close(self) {
        let Tracked { conn, _live } = self;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Error while closing connection");
        }
    }
}

/// A checked-out connection.
///
/// Hand it back with `ConnectionPool::release`. Dropping it instead discards
/// the physical connection, which aborts any statement still running on it.
pub struct PooledConnection<T> {
    // field order matters: the connection goes before its slot is freed
    conn: Tracked<T>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn.conn
    }
}

impl<T> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn.conn
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct Generation<T> {
    id: u64,
    idle: Vec<Tracked<T>>,
}

struct PoolState<T> {
    current: Option<Generation<T>>,
    next_generation: u64,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    closed: bool,
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    live: Arc<AtomicUsize>,
    state: Mutex<PoolState<C::Conn>>,
}

impl<C: Connector> ConnectionPool<C> {
    /// Nothing is opened until the first `acquire()`.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        ConnectionPool {
            connector,
            config: PoolConfig { max_size, ..config },
            slots: Arc::new(Semaphore::new(max_size)),
            live: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(PoolState {
                current: None,
                next_generation: 1,
                failure_count: 0,
                last_failure: None,
                last_failure_time: None,
                closed: false,
            }),
        }
    }

    fn backoff(&self) -> Duration {
        Duration::from_secs(self.config.backoff_secs)
    }

    /// Remaining backoff, if the pool is currently refusing to connect.
    fn backoff_remaining(&self, state: &PoolState<C::Conn>) -> Option<Duration> {
        if state.failure_count < self.config.failure_threshold {
            return None;
        }
        let elapsed = state.last_failure?.elapsed();
        let window = self.backoff();
        (elapsed < window).then(|| window - elapsed)
    }

    fn check_available(&self, state: &PoolState<C::Conn>) -> Result<(), PoolError> {
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        if let Some(retry_after) = self.backoff_remaining(state) {
            return Err(PoolError::PoolInBackoff {
                failures: state.failure_count,
                retry_after,
            });
        }
        Ok(())
    }

    /// Check out a probed connection.
    pub async fn acquire(&self) -> Result<PooledConnection<C::Conn>, PoolError> {
        self.check_available(&*self.state.lock().await)?;

        let wait = Duration::from_millis(self.config.acquire_timeout_ms);
        let permit = match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::PoolClosed),
            Err(_) => {
                tracing::warn!(max_size = self.config.max_size, "Connection pool exhausted");
                return Err(PoolError::PoolExhausted {
                    waited_ms: self.config.acquire_timeout_ms,
                });
            }
        };

        let (mut conn, generation) = {
            let mut state = self.state.lock().await;
            // state may have changed while waiting for a slot
            self.check_available(&state)?;
            match self.checkout(&mut state).await {
                Ok(checked_out) => checked_out,
                Err(e) => {
                    self.record_failure(&mut state, &e).await;
                    return Err(PoolError::ConnectFailed(e));
                }
            }
        };

        if let Err(e) = conn.conn.probe().await {
            drop(conn);
            let mut state = self.state.lock().await;
            self.record_failure(&mut state, &e).await;
            return Err(PoolError::ConnectFailed(e));
        }

        let mut state = self.state.lock().await;
        if state.failure_count > 0 {
            tracing::info!(previous_failures = state.failure_count, "Connection pool recovered");
        }
        state.failure_count = 0;
        drop(state);

        Ok(PooledConnection {
            conn,
            generation,
            _permit: permit,
        })
    }

    /// Take an idle connection or open a new one, creating the pool generation
    /// first if there is none.
    async fn checkout(&self, state: &mut PoolState<C::Conn>) -> Result<(Tracked<C::Conn>, u64), DriverError> {
        if let Some(generation) = state.current.as_mut() {
            if let Some(conn) = generation.idle.pop() {
                return Ok((conn, generation.id));
            }
            let id = generation.id;
            return Ok((self.open().await?, id));
        }

        // caller holds one slot; its connection counts toward min_size
        let first = self.open().await?;
        let id = state.next_generation;
        state.next_generation += 1;

        let mut idle = Vec::new();
        for _ in 1..self.config.min_size {
            let Ok(_slot) = self.slots.try_acquire() else {
                break;
            };
            match self.open().await {
                Ok(conn) => idle.push(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not pre-open idle connection");
                    break;
                }
            }
        }

        state.current = Some(Generation { id, idle });
        state.failure_count = 0;
        tracing::info!(
            target_db = %self.connector.describe(),
            generation = id,
            min_size = self.config.min_size,
            max_size = self.config.max_size,
            "Connection pool created"
        );
        Ok((first, id))
    }

    async fn open(&self) -> Result<Tracked<C::Conn>, DriverError> {
        let conn = self.connector.connect().await?;
        Ok(Tracked {
            conn,
            _live: LiveGuard::new(&self.live),
        })
    }

    async fn record_failure(&self, state: &mut PoolState<C::Conn>, error: &DriverError) {
        state.failure_count += 1;
        state.last_failure = Some(Instant::now());
        state.last_failure_time = Some(Utc::now());
        tracing::warn!(
            failures = state.failure_count,
            error = %error,
            "Connection pool acquisition failed"
        );

        if state.failure_count >= TEARDOWN_AFTER {
            if let Some(generation) = state.current.take() {
                tracing::warn!(generation = generation.id, "Tearing down connection pool");
                for conn in generation.idle {
                    conn.close().await;
                }
            }
        }
    }

    /// Return a connection. With `force_close` (or when it belongs to a
    /// torn-down generation, or the pool is closed) it is closed instead.
    pub async fn release(&self, conn: PooledConnection<C::Conn>, force_close: bool) {
        let PooledConnection {
            conn,
            generation,
            _permit: permit,
        } = conn;

        let discard = {
            let mut state = self.state.lock().await;
            let closed = state.closed;
            match state.current.as_mut() {
                Some(current) if !force_close && !closed && current.id == generation => {
                    current.idle.push(conn);
                    None
                }
                _ => Some(conn),
            }
        };

        if let Some(conn) = discard {
            conn.close().await;
        }
        drop(permit);
    }

    /// Close idle connections and refuse further acquisitions.
    /// Connections still checked out are closed when released.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.current.take().map(|g| g.idle).unwrap_or_default()
        };
        self.slots.close();
        for conn in idle {
            conn.close().await;
        }
        tracing::info!("Connection pool closed");
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let retry_after = self.backoff_remaining(&state);
        PoolStats {
            target: self.connector.describe(),
            exists: state.current.is_some(),
            closed: state.closed,
            generation: state.current.as_ref().map_or(0, |g| g.id),
            open: self.live.load(Ordering::SeqCst),
            idle: state.current.as_ref().map_or(0, |g| g.idle.len()),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            failure_count: state.failure_count,
            last_failure_time: state.last_failure_time,
            in_backoff: retry_after.is_some(),
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Shared {
        connects: AtomicUsize,
        alive: AtomicUsize,
        peak: AtomicUsize,
        fail_connect: AtomicBool,
        fail_probe: AtomicBool,
    }

    struct MockConnector(Arc<Shared>);

    struct MockConn(Arc<Shared>);

    impl Drop for MockConn {
        fn drop(&mut self) {
            self.0.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connection for MockConn {
        async fn fetch(&mut self, _sql: &str) -> Result<Vec<Row>, DriverError> {
            if self.0.fail_probe.load(Ordering::SeqCst) {
                return Err(DriverError::new(DriverErrorKind::Io, "connection reset by peer"));
            }
            Ok(Vec::new())
        }

        async fn close(self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Conn = MockConn;

        async fn connect(&self) -> Result<MockConn, DriverError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_connect.load(Ordering::SeqCst) {
                return Err(DriverError::new(DriverErrorKind::Io, "connection refused"));
            }
            let alive = self.0.alive.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(alive, Ordering::SeqCst);
            Ok(MockConn(self.0.clone()))
        }
    }

    fn pool(config: PoolConfig) -> (Arc<ConnectionPool<MockConnector>>, Arc<Shared>) {
        let shared = Arc::new(Shared::default());
        let pool = ConnectionPool::new(MockConnector(shared.clone()), config);
        (Arc::new(pool), shared)
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_more_than_max_connections() {
        let (pool, shared) = pool(PoolConfig {
            min_size: 2,
            max_size: 3,
            ..PoolConfig::default()
        });

        let mut tasks = Vec::new();
        for i in 0..12 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(10 + i)).await;
                // every other caller drops instead of releasing
                if i % 2 == 0 {
                    pool.release(conn, false).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(shared.peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats().await;
        assert!(stats.open <= 3);
        assert_eq!(stats.open, shared.alive.load(Ordering::SeqCst));
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_after_three_failures() {
        let (pool, shared) = pool(PoolConfig::default());
        shared.fail_connect.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            assert!(matches!(pool.acquire().await, Err(PoolError::ConnectFailed(_))));
        }
        match pool.acquire().await {
            Err(PoolError::PoolInBackoff { failures, retry_after }) => {
                assert_eq!(failures, 3);
                assert!(retry_after <= Duration::from_secs(30));
            }
            other => panic!("expected backoff, got {:?}", other.err()),
        }
        assert_eq!(shared.connects.load(Ordering::SeqCst), 3);
        assert!(pool.stats().await.in_backoff);

        // after the window the next acquisition tries again
        tokio::time::advance(Duration::from_secs(30)).await;
        shared.fail_connect.store(false, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(shared.connects.load(Ordering::SeqCst), 4);
        pool.release(conn, false).await;

        let stats = pool.stats().await;
        assert_eq!(stats.failure_count, 0);
        assert!(!stats.in_backoff);
    }

    #[tokio::test]
    async fn test_probe_failures_tear_down_pool() {
        let (pool, shared) = pool(PoolConfig::default());

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, false).await;
        let stats = pool.stats().await;
        assert!(stats.exists);
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.idle, 1);

        shared.fail_probe.store(true, Ordering::SeqCst);
        assert!(matches!(pool.acquire().await, Err(PoolError::ConnectFailed(_))));
        assert!(pool.stats().await.exists);
        assert!(matches!(pool.acquire().await, Err(PoolError::ConnectFailed(_))));

        let stats = pool.stats().await;
        assert!(!stats.exists);
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.open, 0);

        shared.fail_probe.store(false, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.generation, 2);
        assert_eq!(stats.failure_count, 0);
        pool.release(conn, false).await;
    }

    #[tokio::test]
    async fn test_force_close_and_drop_discard_connection() {
        let (pool, shared) = pool(PoolConfig::default());

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true).await;
        assert_eq!(shared.alive.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().await.idle, 0);

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(shared.alive.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().await.open, 0);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, false).await;
        assert_eq!(pool.stats().await.idle, 1);
        assert_eq!(shared.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_not_a_failure() {
        let (pool, _shared) = pool(PoolConfig {
            max_size: 1,
            acquire_timeout_ms: 100,
            ..PoolConfig::default()
        });

        let held = pool.acquire().await.unwrap();
        assert_eq!(
            pool.acquire().await.err(),
            Some(PoolError::PoolExhausted { waited_ms: 100 })
        );
        assert_eq!(pool.stats().await.failure_count, 0);

        pool.release(held, false).await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_refuses_and_discards_outstanding() {
        let (pool, shared) = pool(PoolConfig {
            min_size: 2,
            ..PoolConfig::default()
        });

        let conn = pool.acquire().await.unwrap();
        assert_eq!(shared.alive.load(Ordering::SeqCst), 2);

        pool.close().await;
        assert_eq!(shared.alive.load(Ordering::SeqCst), 1);
        assert_eq!(pool.acquire().await.err(), Some(PoolError::PoolClosed));

        pool.release(conn, false).await;
        assert_eq!(shared.alive.load(Ordering::SeqCst), 0);
        assert!(pool.stats().await.closed);
    }
}
