//! Slow-statement log filter.
//!
//! A pure observer: times the onward call and logs statements that exceed
//! the configured threshold through `tracing`. Marks the statement proxy's
//! attribute bag so later filters can tell a slow statement was already
//! reported.

use std::time::Duration;

use async_trait::async_trait;

use palisade_driver::{Result, Value};

use crate::chain::FilterChain;
use crate::filter::Filter;
use crate::proxy::{AttrValue, ResultSetProxy, StatementProxy};

/// Attribute key set on statements reported as slow.
pub const ATTR_SLOW_MILLIS: &str = "slowlog.millis";

/// Logs statements slower than a threshold.
#[derive(Debug, Clone)]
pub struct SlowLogFilter {
    threshold: Duration,
}

impl SlowLogFilter {
    /// Create a filter with the given slowness threshold.
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    fn report(&self, stmt: &StatementProxy, sql: &str, elapsed: Duration) {
        if elapsed < self.threshold {
            return;
        }
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        stmt.attributes()
            .set(ATTR_SLOW_MILLIS, AttrValue::Int(millis as i64));
        tracing::warn!(
            statement_id = stmt.id(),
            connection_id = stmt.connection().id(),
            elapsed_ms = millis,
            sql = sql,
            "slow statement"
        );
    }
}

impl Default for SlowLogFilter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Filter for SlowLogFilter {
    fn name(&self) -> &str {
        "slowlog"
    }

    async fn statement_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        let started = std::time::Instant::now();
        let result = chain.statement_execute(stmt, sql, params).await;
        self.report(stmt, sql, started.elapsed());
        result
    }

    async fn statement_execute_update(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        let started = std::time::Instant::now();
        let result = chain.statement_execute_update(stmt, sql, params).await;
        self.report(stmt, sql, started.elapsed());
        result
    }

    async fn statement_execute_query(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        let started = std::time::Instant::now();
        let result = chain.statement_execute_query(stmt, sql, params).await;
        self.report(stmt, sql, started.elapsed());
        result
    }

    async fn prepared_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        let sql = stmt.sql().unwrap_or_default().to_string();
        let started = std::time::Instant::now();
        let result = chain.prepared_execute(stmt, params).await;
        self.report(stmt, &sql, started.elapsed());
        result
    }

    async fn prepared_execute_update(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        let sql = stmt.sql().unwrap_or_default().to_string();
        let started = std::time::Instant::now();
        let result = chain.prepared_execute_update(stmt, params).await;
        self.report(stmt, &sql, started.elapsed());
        result
    }

    async fn prepared_execute_query(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        let sql = stmt.sql().unwrap_or_default().to_string();
        let started = std::time::Instant::now();
        let result = chain.prepared_execute_query(stmt, params).await;
        self.report(stmt, &sql, started.elapsed());
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::proxy::ConnectionProxy;
    use palisade_driver::{ConnectSpec, Driver};
    use palisade_testing::MockDriver;
    use std::sync::Arc;

    async fn direct_statement() -> StatementProxy {
        let driver = MockDriver::new();
        let conn = driver
            .connect(&ConnectSpec::new("mock://test"))
            .await
            .unwrap();
        StatementProxy::direct(Arc::new(ConnectionProxy::new(conn)))
    }

    #[tokio::test]
    async fn test_slow_statement_marked() {
        let filter = SlowLogFilter::new(Duration::from_millis(10));
        let stmt = direct_statement().await;

        filter.report(&stmt, "SELECT 1", Duration::from_millis(50));
        match stmt.attributes().get(ATTR_SLOW_MILLIS) {
            Some(AttrValue::Int(ms)) => assert!(ms >= 50),
            other => panic!("expected slow marker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fast_statement_not_marked() {
        let filter = SlowLogFilter::new(Duration::from_millis(100));
        let stmt = direct_statement().await;

        filter.report(&stmt, "SELECT 1", Duration::from_millis(5));
        assert!(stmt.attributes().get(ATTR_SLOW_MILLIS).is_none());
    }
}
