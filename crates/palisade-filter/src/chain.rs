//! The chain-of-responsibility mechanism.
//!
//! A [`FilterPipeline`] owns the ordered filter list (fixed at pool build
//! time) and the driver used by terminal operations. For each logical call
//! it constructs a transient [`FilterChain`] cursor. Invoking an operation
//! on the chain advances the cursor by exactly one filter; when the cursor
//! runs past the end, the terminal step performs the real driver operation
//! exactly once.
//!
//! The chain is moved into each filter by value, so "calls onward at most
//! once" is enforced by the type system rather than by convention.

use std::sync::Arc;
use std::time::Duration;

use palisade_driver::{ConnectSpec, Driver, Error, Result, Row, Value};

use crate::filter::{Filter, PoolFacade};
use crate::proxy::{ConnectionProxy, ResultSetProxy, StatementProxy};

/// Ordered filter list plus the terminal driver, shared by every logical
/// call of one pool instance.
pub struct FilterPipeline {
    filters: Vec<Arc<dyn Filter>>,
    driver: Arc<dyn Driver>,
}

impl FilterPipeline {
    /// Build a pipeline over the given ordered filters and driver.
    #[must_use]
    pub fn new(filters: Vec<Arc<dyn Filter>>, driver: Arc<dyn Driver>) -> Self {
        Self { filters, driver }
    }

    /// Names of the configured filters, in execution order.
    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// The driver terminals delegate to.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Start a fresh chain for one logical call.
    #[must_use]
    pub fn chain(&self) -> FilterChain<'_> {
        FilterChain {
            filters: &self.filters,
            driver: &self.driver,
            pos: 0,
        }
    }

    /// Run the connect operation through the full chain.
    pub async fn connection_connect(&self, spec: &ConnectSpec) -> Result<Arc<ConnectionProxy>> {
        self.chain().connection_connect(spec).await
    }

    /// Run the physical-close operation through the full chain.
    pub async fn connection_close(&self, conn: &ConnectionProxy) -> Result<()> {
        self.chain().connection_close(conn).await
    }

    /// Run a direct execute through the full chain.
    pub async fn statement_execute(
        &self,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        self.chain().statement_execute(stmt, sql, params).await
    }

    /// Run a direct execute-update through the full chain.
    pub async fn statement_execute_update(
        &self,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        self.chain().statement_execute_update(stmt, sql, params).await
    }

    /// Run a direct query through the full chain.
    pub async fn statement_execute_query(
        &self,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        self.chain().statement_execute_query(stmt, sql, params).await
    }

    /// Run a batch execute through the full chain.
    pub async fn statement_execute_batch(
        &self,
        stmt: &StatementProxy,
        batch: &[String],
    ) -> Result<Vec<u64>> {
        self.chain().statement_execute_batch(stmt, batch).await
    }

    /// Run a prepared execute through the full chain.
    pub async fn prepared_execute(&self, stmt: &StatementProxy, params: &[Value]) -> Result<u64> {
        self.chain().prepared_execute(stmt, params).await
    }

    /// Run a prepared execute-update through the full chain.
    pub async fn prepared_execute_update(
        &self,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        self.chain().prepared_execute_update(stmt, params).await
    }

    /// Run a prepared query through the full chain.
    pub async fn prepared_execute_query(
        &self,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        self.chain().prepared_execute_query(stmt, params).await
    }

    /// Fetch the next row through the full chain.
    pub async fn result_set_next(&self, rs: &mut ResultSetProxy) -> Result<Option<Row>> {
        self.chain().result_set_next(rs).await
    }

    /// Close a cursor through the full chain.
    pub async fn result_set_close(&self, rs: &mut ResultSetProxy) -> Result<()> {
        self.chain().result_set_close(rs).await
    }

    /// Run a pool borrow through the full chain.
    pub async fn data_source_acquire(
        &self,
        pool: &dyn PoolFacade,
        timeout: Duration,
    ) -> Result<Arc<ConnectionProxy>> {
        self.chain().data_source_acquire(pool, timeout).await
    }

    /// Run a pool return through the full chain.
    pub async fn data_source_release(
        &self,
        pool: &dyn PoolFacade,
        conn: &ConnectionProxy,
    ) -> Result<()> {
        self.chain().data_source_release(pool, conn).await
    }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline")
            .field("filters", &self.filter_names())
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// Transient cursor over the pipeline for one logical call.
///
/// Owned by value; every operation consumes it. `pos` is the next filter
/// to invoke; past the end the terminal driver operation runs.
pub struct FilterChain<'a> {
    filters: &'a [Arc<dyn Filter>],
    driver: &'a Arc<dyn Driver>,
    pos: usize,
}

impl FilterChain<'_> {
    /// Advance the cursor, yielding the next filter (if any) and the chain
    /// positioned after it.
    fn split(mut self) -> (Option<Arc<dyn Filter>>, Self) {
        match self.filters.get(self.pos) {
            Some(f) => {
                let f = Arc::clone(f);
                self.pos += 1;
                (Some(f), self)
            }
            None => (None, self),
        }
    }

    /// See [`Filter::connection_connect`].
    pub async fn connection_connect(self, spec: &ConnectSpec) -> Result<Arc<ConnectionProxy>> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.connection_connect(chain, spec).await,
            None => {
                let conn = chain.driver.connect(spec).await?;
                Ok(Arc::new(ConnectionProxy::new(conn)))
            }
        }
    }

    /// See [`Filter::connection_close`].
    pub async fn connection_close(self, conn: &ConnectionProxy) -> Result<()> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.connection_close(chain, conn).await,
            None => conn.close_physical().await,
        }
    }

    /// See [`Filter::statement_execute`].
    pub async fn statement_execute(
        self,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.statement_execute(chain, stmt, sql, params).await,
            None => stmt.connection().raw()?.execute(sql, params).await,
        }
    }

    /// See [`Filter::statement_execute_update`].
    pub async fn statement_execute_update(
        self,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.statement_execute_update(chain, stmt, sql, params).await,
            None => stmt.connection().raw()?.execute(sql, params).await,
        }
    }

    /// See [`Filter::statement_execute_query`].
    pub async fn statement_execute_query(
        self,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.statement_execute_query(chain, stmt, sql, params).await,
            None => {
                let rows = stmt.connection().raw()?.query(sql, params).await?;
                Ok(ResultSetProxy::new(stmt.id(), rows))
            }
        }
    }

    /// See [`Filter::statement_execute_batch`].
    pub async fn statement_execute_batch(
        self,
        stmt: &StatementProxy,
        batch: &[String],
    ) -> Result<Vec<u64>> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.statement_execute_batch(chain, stmt, batch).await,
            None => {
                let conn = stmt.connection().raw()?;
                let mut counts = Vec::with_capacity(batch.len());
                for sql in batch {
                    counts.push(conn.execute(sql, &[]).await?);
                }
                Ok(counts)
            }
        }
    }

    /// See [`Filter::prepared_execute`].
    pub async fn prepared_execute(self, stmt: &StatementProxy, params: &[Value]) -> Result<u64> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.prepared_execute(chain, stmt, params).await,
            None => {
                let handle = prepared_handle(stmt)?;
                stmt.connection().raw()?;
                handle.execute(params).await
            }
        }
    }

    /// See [`Filter::prepared_execute_update`].
    pub async fn prepared_execute_update(
        self,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.prepared_execute_update(chain, stmt, params).await,
            None => {
                let handle = prepared_handle(stmt)?;
                stmt.connection().raw()?;
                handle.execute(params).await
            }
        }
    }

    /// See [`Filter::prepared_execute_query`].
    pub async fn prepared_execute_query(
        self,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.prepared_execute_query(chain, stmt, params).await,
            None => {
                let handle = prepared_handle(stmt)?;
                stmt.connection().raw()?;
                let rows = handle.query(params).await?;
                Ok(ResultSetProxy::new(stmt.id(), rows))
            }
        }
    }

    /// See [`Filter::result_set_next`].
    pub async fn result_set_next(self, rs: &mut ResultSetProxy) -> Result<Option<Row>> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.result_set_next(chain, rs).await,
            None => {
                let row = rs.raw()?.next().await?;
                if row.is_some() {
                    rs.record_row();
                }
                Ok(row)
            }
        }
    }

    /// See [`Filter::result_set_close`].
    pub async fn result_set_close(self, rs: &mut ResultSetProxy) -> Result<()> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.result_set_close(chain, rs).await,
            None => rs.close_cursor().await,
        }
    }

    /// See [`Filter::data_source_acquire`].
    pub async fn data_source_acquire(
        self,
        pool: &dyn PoolFacade,
        timeout: Duration,
    ) -> Result<Arc<ConnectionProxy>> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.data_source_acquire(chain, pool, timeout).await,
            None => pool.acquire_direct(timeout).await,
        }
    }

    /// See [`Filter::data_source_release`].
    pub async fn data_source_release(
        self,
        pool: &dyn PoolFacade,
        conn: &ConnectionProxy,
    ) -> Result<()> {
        let (next, chain) = self.split();
        match next {
            Some(f) => f.data_source_release(chain, pool, conn).await,
            None => pool.release_direct(conn).await,
        }
    }
}

fn prepared_handle(stmt: &StatementProxy) -> Result<Arc<dyn palisade_driver::DriverStatement>> {
    stmt.prepared_handle().cloned().ok_or_else(|| {
        Error::operation(format!("statement proxy {} is not prepared", stmt.id()))
    })
}
