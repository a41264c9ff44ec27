//! All-or-nothing execution of a unit of work on one pooled connection

use crate::db::error::{DbError, TxStage};
use crate::db::pool::{ConnectionPool, Lease};
use crate::db::session::{Driver, Session};
use futures::future::BoxFuture;
use tracing::{debug, error, instrument, warn};

/// Runs closures inside a transaction on a connection of its own
pub struct TransactionRunner<M: Driver> {
    pool: ConnectionPool<M>,
}

impl<M: Driver> Clone for TransactionRunner<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<M: Driver> TransactionRunner<M> {
    pub fn new(pool: ConnectionPool<M>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool<M> {
        &self.pool
    }

    /// Run `work` inside a transaction
    ///
    /// Commits and returns `work`'s value when it succeeds. When it fails
    /// the transaction is rolled back and `work`'s own error is returned;
    /// a failing rollback is logged and never replaces that error. The
    /// connection is released on every path. No retries are attempted.
    ///
    /// ```ignore
    /// let id = runner
    ///     .with_transaction(|conn| {
    ///         Box::pin(async move {
    ///             conn.query("INSERT INTO focus_sessions (id) VALUES (?)", &[json!(7)]).await?;
    ///             Ok::<_, DbError>(7)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    #[instrument(skip_all)]
    pub async fn with_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Lease<M>) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        // Acquisition failures surface before any transaction exists
        let mut conn = self.pool.acquire().await?;

        conn.begin()
            .await
            .map_err(|source| DbError::transaction(TxStage::Begin, source))?;
        debug!("Transaction began");

        match work(&mut conn).await {
            Ok(value) => {
                if let Err(source) = conn.commit().await {
                    if let Err(rollback_err) = conn.rollback().await {
                        warn!("Rollback after failed commit also failed: {}", rollback_err);
                    }
                    return Err(DbError::transaction(TxStage::Commit, source).into());
                }
                debug!("Transaction committed");
                Ok(value)
            }
            Err(err) => {
                match conn.rollback().await {
                    Ok(()) => debug!("Transaction rolled back"),
                    Err(rollback_err) => error!(
                        "Rollback failed, connection will be discarded: {}",
                        rollback_err
                    ),
                }
                Err(err)
            }
        }
    }
}

impl<M: Driver> ConnectionPool<M> {
    /// Shorthand for [`TransactionRunner::with_transaction`] on this pool
    pub async fn with_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Lease<M>) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        TransactionRunner::new(self.clone()).with_transaction(work).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryConnectionManager;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn runner() -> (MemoryConnectionManager, TransactionRunner<MemoryConnectionManager>) {
        let manager = MemoryConnectionManager::new();
        let pool = ConnectionPool::builder(manager.clone()).max_size(2).build().unwrap();
        (manager, TransactionRunner::new(pool))
    }

    #[tokio::test]
    async fn test_commit_path_returns_value() {
        let (manager, runner) = runner();

        let value = runner
            .with_transaction(|conn| {
                Box::pin(async move {
                    conn.query("INSERT INTO t (id) VALUES (?)", &[json!(1)]).await?;
                    Ok::<_, DbError>("done")
                })
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(manager.store().rows("t").len(), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_is_a_transaction_error() {
        let (manager, runner) = runner();
        manager.faults().begin.store(true, Ordering::Release);

        let result = runner
            .with_transaction(|_conn| Box::pin(async move { Ok::<_, DbError>(()) }))
            .await;

        assert!(matches!(
            result,
            Err(DbError::Transaction {
                stage: TxStage::Begin,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_no_writes() {
        let (manager, runner) = runner();
        manager.faults().commit.store(true, Ordering::Release);

        let result = runner
            .with_transaction(|conn| {
                Box::pin(async move {
                    conn.query("INSERT INTO t (id) VALUES (?)", &[json!(1)]).await?;
                    Ok::<_, DbError>(())
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(DbError::Transaction {
                stage: TxStage::Commit,
                ..
            })
        ));
        assert!(manager.store().rows("t").is_empty());
        assert_eq!(runner.pool().stats().active, 0);
    }
}
