//! Borrowed-connection guards.
//!
//! [`PooledConnection`] is what a caller holds between acquire and
//! release. Every operation on it (and on the statements and result sets
//! it produces) routes through the pool's filter pipeline. Logical close
//! returns the connection to the pool and invalidates the guard; dropping
//! the guard without closing releases it in the background.

use std::sync::Arc;

use palisade_driver::{Result, Row, Value};
use palisade_filter::{Attributes, ConnectionProxy, ResultSetProxy, StatementProxy};

use crate::pool::PoolInner;

/// A connection borrowed from the pool.
pub struct PooledConnection {
    proxy: Arc<ConnectionProxy>,
    inner: Arc<PoolInner>,
    released: bool,
}

impl PooledConnection {
    pub(crate) fn new(proxy: Arc<ConnectionProxy>, inner: Arc<PoolInner>) -> Self {
        Self {
            proxy,
            inner,
            released: false,
        }
    }

    /// Correlation id of the underlying connection proxy.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.proxy.id()
    }

    /// Attribute bag shared with the filters seeing this connection.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        self.proxy.attributes()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(palisade_driver::Error::operation(format!(
                "connection {} already released to the pool",
                self.proxy.id()
            )));
        }
        Ok(())
    }

    /// Execute a statement for its side effects.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_live()?;
        let stmt = StatementProxy::direct(Arc::clone(&self.proxy));
        self.inner.pipeline.statement_execute(&stmt, sql, params).await
    }

    /// Execute a statement for an update count.
    pub async fn execute_update(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_live()?;
        let stmt = StatementProxy::direct(Arc::clone(&self.proxy));
        self.inner
            .pipeline
            .statement_execute_update(&stmt, sql, params)
            .await
    }

    /// Execute a statement and get the rows back.
    pub async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<PooledRows> {
        self.ensure_live()?;
        let stmt = StatementProxy::direct(Arc::clone(&self.proxy));
        let rs = self
            .inner
            .pipeline
            .statement_execute_query(&stmt, sql, params)
            .await?;
        Ok(PooledRows {
            proxy: rs,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Execute a batch of statements.
    pub async fn execute_batch(&self, batch: &[String]) -> Result<Vec<u64>> {
        self.ensure_live()?;
        let stmt = StatementProxy::direct(Arc::clone(&self.proxy));
        self.inner.pipeline.statement_execute_batch(&stmt, batch).await
    }

    /// Prepare a statement, consulting the connection's statement cache.
    pub async fn prepare(&self, sql: &str) -> Result<PooledStatement> {
        self.ensure_live()?;
        let handle = self.inner.prepared_statement(&self.proxy, sql).await?;
        Ok(PooledStatement {
            stmt: StatementProxy::prepared(Arc::clone(&self.proxy), handle),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Logically close this borrow, returning the connection to the pool.
    ///
    /// Closing twice is harmless; the pool reports a warning and ignores
    /// the second return.
    pub async fn close(mut self) -> Result<()> {
        self.released = true;
        self.inner
            .pipeline
            .data_source_release(&*self.inner, &self.proxy)
            .await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let proxy = Arc::clone(&self.proxy);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.pipeline.data_source_release(&*inner, &proxy).await {
                        tracing::warn!(connection_id = proxy.id(), error = %e, "background release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = proxy.id(),
                    "pooled connection dropped outside a runtime; \
                     the abandoned-connection scan will reclaim it"
                );
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection_id", &self.proxy.id())
            .field("released", &self.released)
            .finish()
    }
}

/// A prepared statement bound to a borrowed connection.
pub struct PooledStatement {
    stmt: StatementProxy,
    inner: Arc<PoolInner>,
}

impl PooledStatement {
    /// Correlation id of the statement proxy.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.stmt.id()
    }

    /// The SQL this statement was prepared from.
    #[must_use]
    pub fn sql(&self) -> &str {
        self.stmt.sql().unwrap_or_default()
    }

    /// Attribute bag of the statement proxy.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        self.stmt.attributes()
    }

    /// Execute for side effects.
    pub async fn execute(&self, params: &[Value]) -> Result<u64> {
        self.inner.pipeline.prepared_execute(&self.stmt, params).await
    }

    /// Execute for an update count.
    pub async fn execute_update(&self, params: &[Value]) -> Result<u64> {
        self.inner
            .pipeline
            .prepared_execute_update(&self.stmt, params)
            .await
    }

    /// Execute and get the rows back.
    pub async fn execute_query(&self, params: &[Value]) -> Result<PooledRows> {
        let rs = self
            .inner
            .pipeline
            .prepared_execute_query(&self.stmt, params)
            .await?;
        Ok(PooledRows {
            proxy: rs,
            inner: Arc::clone(&self.inner),
        })
    }
}

impl std::fmt::Debug for PooledStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledStatement")
            .field("statement_id", &self.stmt.id())
            .field("sql", &self.sql())
            .finish()
    }
}

/// An open result set from a pooled connection.
pub struct PooledRows {
    proxy: ResultSetProxy,
    inner: Arc<PoolInner>,
}

impl PooledRows {
    /// Correlation id of the result-set proxy.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.proxy.id()
    }

    /// Rows fetched so far.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.proxy.row_count()
    }

    /// Attribute bag of the result-set proxy.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        self.proxy.attributes()
    }

    /// Fetch the next row.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        self.inner.pipeline.result_set_next(&mut self.proxy).await
    }

    /// Close the cursor. Further fetches fail fast.
    pub async fn close(&mut self) -> Result<()> {
        self.inner.pipeline.result_set_close(&mut self.proxy).await
    }

    /// Drain the remaining rows and close the cursor.
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        self.close().await?;
        Ok(rows)
    }
}

impl std::fmt::Debug for PooledRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledRows")
            .field("result_set_id", &self.proxy.id())
            .field("row_count", &self.proxy.row_count())
            .finish()
    }
}
