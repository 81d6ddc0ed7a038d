/// Query executor
///
/// Runs one materialized statement: guard check, pooled connection, server
/// timeouts, client deadline, row shrinking. Acquisition and execution run
/// inside the `database` circuit breaker; only fatal classes count against it.

pub mod classify;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::breaker::CircuitBreaker;
use crate::config::{DatabaseConfig, ShrinkConfig};
use crate::pool::{Connection, ConnectionPool, Connector};
use crate::query::{shrink_rows, sql, MaterializedQuery, Row, RowSet};

pub use classify::{ErrorClass, ExecError, FatalKind};

/// Extra time the client waits past the server-side statement timeout.
const CLIENT_GRACE: Duration = Duration::from_secs(5);

pub struct QueryExecutor<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    breaker: Arc<CircuitBreaker>,
    statement_timeout: Duration,
    shrink: ShrinkConfig,
}

impl<C: Connector> QueryExecutor<C> {
    pub fn new(
        pool: Arc<ConnectionPool<C>>,
        breaker: Arc<CircuitBreaker>,
        database: &DatabaseConfig,
        shrink: ShrinkConfig,
    ) -> Self {
        QueryExecutor {
            pool,
            breaker,
            statement_timeout: Duration::from_millis(database.statement_timeout_ms),
            shrink,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Execute `query` and return its shrunk rows.
    pub async fn execute(&self, query: &MaterializedQuery) -> Result<RowSet, ExecError> {
        if let Err(reason) = sql::validate_select(&query.text) {
            tracing::warn!(reason = %reason, "Statement rejected before execution");
            return Err(ExecError::rejected(reason));
        }

        let started = Instant::now();
        let result = self
            .breaker
            .call_classified(|| self.run(&query.text), ExecError::is_breaker_failure)
            .await
            .map_err(ExecError::from);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(rows) => {
                let set = shrink_rows(rows, &self.shrink);
                tracing::info!(
                    statement = %query.redacted(),
                    elapsed_ms,
                    rows = set.total,
                    returned = set.returned,
                    truncated = set.truncated,
                    "Statement executed"
                );
                Ok(set)
            }
            Err(e) => {
                tracing::warn!(
                    statement = %query.redacted(),
                    elapsed_ms,
                    class = %e.class,
                    code = e.code.as_deref().unwrap_or(""),
                    reason = %e.reason,
                    "Statement failed"
                );
                Err(e)
            }
        }
    }

    async fn run(&self, text: &str) -> Result<Vec<Row>, ExecError> {
        let mut conn = self.pool.acquire().await?;
        let deadline = self.statement_timeout + CLIENT_GRACE;
        let statement_timeout = self.statement_timeout;

        let outcome = tokio::time::timeout(deadline, async {
            conn.set_timeouts(statement_timeout, statement_timeout).await?;
            conn.fetch(text).await
        })
        .await;

        match outcome {
            Ok(Ok(rows)) => {
                self.pool.release(conn, false).await;
                Ok(rows)
            }
            Ok(Err(driver)) => {
                let e = ExecError::from(driver);
                // a fatal error may leave the session in an unknown state
                self.pool.release(conn, e.class.is_fatal()).await;
                Err(e)
            }
            Err(_) => {
                // dropping the connection aborts the statement server-side
                drop(conn);
                Err(ExecError::deadline(deadline.as_millis() as u64))
            }
        }
    }

    /// Acquire and release one connection, through the breaker.
    pub async fn check(&self) -> Result<(), ExecError> {
        self.breaker
            .call_classified(
                || async {
                    let conn = self.pool.acquire().await?;
                    self.pool.release(conn, false).await;
                    Ok::<(), ExecError>(())
                },
                ExecError::is_breaker_failure,
            )
            .await
            .map_err(ExecError::from)
    }
}
