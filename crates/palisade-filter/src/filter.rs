//! The filter capability trait.
//!
//! A filter implements the interception points it cares about and inherits
//! pass-through behavior for the rest; there is no adapter hierarchy. For
//! every logical call the chain hands the filter a [`FilterChain`] cursor;
//! the filter may run code before and after calling onward, short-circuit
//! by returning without calling onward, or simply pass through.
//!
//! Calling onward consumes the chain value, so a filter can advance the
//! chain at most once per logical call; the terminal driver operation runs
//! exactly once unless a filter intentionally short-circuits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use palisade_driver::{ConnectSpec, Result, Row, Value};

use crate::chain::FilterChain;
use crate::proxy::{ConnectionProxy, ResultSetProxy, StatementProxy};

/// The pool surface the chain's data-source terminals call back into.
///
/// Implemented by the pool manager; filters only ever see it as an opaque
/// collaborator, which keeps the dependency arrow pointing pool → filter.
#[async_trait]
pub trait PoolFacade: Send + Sync {
    /// Name of the pool, used as a correlation key in logs and stats.
    fn pool_name(&self) -> &str;

    /// Borrow a connection, bypassing the filter chain.
    async fn acquire_direct(&self, timeout: Duration) -> Result<Arc<ConnectionProxy>>;

    /// Return a borrowed connection, bypassing the filter chain.
    async fn release_direct(&self, conn: &ConnectionProxy) -> Result<()>;
}

/// An interception capability set.
///
/// Every method defaults to calling onward unchanged. Override only the
/// points the filter participates in. Implementations must be stateless
/// across calls except for filters that are themselves collectors; those
/// own their own synchronized aggregation state.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Name used in configuration and logs.
    fn name(&self) -> &str;

    /// A physical connection is being established.
    async fn connection_connect(
        &self,
        chain: FilterChain<'_>,
        spec: &ConnectSpec,
    ) -> Result<Arc<ConnectionProxy>> {
        chain.connection_connect(spec).await
    }

    /// A physical connection is being closed.
    async fn connection_close(
        &self,
        chain: FilterChain<'_>,
        conn: &ConnectionProxy,
    ) -> Result<()> {
        chain.connection_close(conn).await
    }

    /// A direct statement is executed for its side effects.
    async fn statement_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        chain.statement_execute(stmt, sql, params).await
    }

    /// A direct statement is executed for an update count.
    async fn statement_execute_update(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        chain.statement_execute_update(stmt, sql, params).await
    }

    /// A direct statement is executed for rows.
    async fn statement_execute_query(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        chain.statement_execute_query(stmt, sql, params).await
    }

    /// A batch of statements is executed.
    async fn statement_execute_batch(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        batch: &[String],
    ) -> Result<Vec<u64>> {
        chain.statement_execute_batch(stmt, batch).await
    }

    /// A prepared statement is executed for its side effects.
    async fn prepared_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        chain.prepared_execute(stmt, params).await
    }

    /// A prepared statement is executed for an update count.
    async fn prepared_execute_update(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        chain.prepared_execute_update(stmt, params).await
    }

    /// A prepared statement is executed for rows.
    async fn prepared_execute_query(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        chain.prepared_execute_query(stmt, params).await
    }

    /// A row is fetched from a result set.
    async fn result_set_next(
        &self,
        chain: FilterChain<'_>,
        rs: &mut ResultSetProxy,
    ) -> Result<Option<Row>> {
        chain.result_set_next(rs).await
    }

    /// A result-set cursor is closed.
    async fn result_set_close(
        &self,
        chain: FilterChain<'_>,
        rs: &mut ResultSetProxy,
    ) -> Result<()> {
        chain.result_set_close(rs).await
    }

    /// A caller is borrowing a connection from the pool.
    async fn data_source_acquire(
        &self,
        chain: FilterChain<'_>,
        pool: &dyn PoolFacade,
        timeout: Duration,
    ) -> Result<Arc<ConnectionProxy>> {
        chain.data_source_acquire(pool, timeout).await
    }

    /// A caller is returning a connection to the pool.
    async fn data_source_release(
        &self,
        chain: FilterChain<'_>,
        pool: &dyn PoolFacade,
        conn: &ConnectionProxy,
    ) -> Result<()> {
        chain.data_source_release(pool, conn).await
    }
}
