//! Statistics aggregation filter.
//!
//! [`StatFilter`] wraps every statement operation: it records start time
//! before calling onward and updates the per-fingerprint counters after,
//! whether the call succeeded or failed; the error itself propagates
//! unchanged. Running-statement gauges are maintained by a drop guard so
//! they stay correct even if a downstream filter panics.
//!
//! All hot-path counters are atomics; the fingerprint table takes its
//! write lock only the first time a fingerprint is seen.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;

use palisade_driver::{ConnectSpec, Result, Value};

use crate::chain::FilterChain;
use crate::filter::{Filter, PoolFacade};
use crate::fingerprint::{LiteralNormalizer, StatementKeyer};
use crate::proxy::{ConnectionProxy, ResultSetProxy, StatementProxy};

/// Counters for one statement fingerprint.
///
/// Created on first execution and kept for the collector's lifetime; the
/// set is bounded by the application's recurring SQL.
#[derive(Debug)]
pub struct StatementStats {
    fingerprint: String,
    execute_count: AtomicU64,
    error_count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
    last_execute_unix_ms: AtomicU64,
    running: AtomicU32,
    concurrent_max: AtomicU32,
}

impl StatementStats {
    fn new(fingerprint: String) -> Self {
        Self {
            fingerprint,
            execute_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            max_micros: AtomicU64::new(0),
            last_execute_unix_ms: AtomicU64::new(0),
            running: AtomicU32::new(0),
            concurrent_max: AtomicU32::new(0),
        }
    }

    /// The fingerprint these counters belong to.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Executions recorded so far.
    #[must_use]
    pub fn execute_count(&self) -> u64 {
        self.execute_count.load(Ordering::Relaxed)
    }

    /// Failed executions recorded so far.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    fn finish(&self, elapsed: Duration, failed: bool) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.execute_count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        store_max_u64(&self.max_micros, micros);
        self.last_execute_unix_ms
            .store(unix_millis(), Ordering::Relaxed);
        if failed {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the counters out.
    #[must_use]
    pub fn snapshot(&self) -> StatementSnapshot {
        StatementSnapshot {
            fingerprint: self.fingerprint.clone(),
            execute_count: self.execute_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            total_millis: self.total_micros.load(Ordering::Relaxed) / 1_000,
            max_millis: self.max_micros.load(Ordering::Relaxed) / 1_000,
            last_execute_unix_ms: self.last_execute_unix_ms.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            concurrent_max: self.concurrent_max.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one fingerprint's counters.
#[derive(Debug, Clone)]
pub struct StatementSnapshot {
    /// Normalized statement text.
    pub fingerprint: String,
    /// Executions.
    pub execute_count: u64,
    /// Failed executions.
    pub error_count: u64,
    /// Total execution time.
    pub total_millis: u64,
    /// Longest single execution.
    pub max_millis: u64,
    /// Wall-clock time of the last execution (0 = never).
    pub last_execute_unix_ms: u64,
    /// Executions in flight right now.
    pub running: u32,
    /// High-water mark of concurrent executions.
    pub concurrent_max: u32,
}

/// Pool-wide and per-fingerprint statistics store.
///
/// Shared between the [`StatFilter`] that feeds it and whatever reporting
/// surface polls [`StatCollector::snapshot`].
#[derive(Debug, Default)]
pub struct StatCollector {
    statements: RwLock<HashMap<String, Arc<StatementStats>>>,
    active_connections: AtomicU32,
    waiting_threads: AtomicU32,
    max_wait_micros: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
    physical_connects: AtomicU64,
    physical_closes: AtomicU64,
    running_statements: AtomicU32,
    statement_concurrent_max: AtomicU32,
}

impl StatCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for a fingerprint, created on first sight.
    pub fn stats_for(&self, fingerprint: &str) -> Arc<StatementStats> {
        if let Some(stats) = self.statements.read().get(fingerprint) {
            return Arc::clone(stats);
        }
        let mut table = self.statements.write();
        Arc::clone(
            table
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(StatementStats::new(fingerprint.to_string()))),
        )
    }

    /// Counters for a fingerprint, if it has been seen.
    pub fn statement(&self, fingerprint: &str) -> Option<Arc<StatementStats>> {
        self.statements.read().get(fingerprint).cloned()
    }

    /// Connections currently borrowed.
    #[must_use]
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Callers currently blocked in acquire.
    #[must_use]
    pub fn waiting_threads(&self) -> u32 {
        self.waiting_threads.load(Ordering::Relaxed)
    }

    /// Copy the whole table and the pool-wide gauges out.
    #[must_use]
    pub fn snapshot(&self) -> StatSnapshot {
        let statements = self
            .statements
            .read()
            .values()
            .map(|s| s.snapshot())
            .collect();
        StatSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            waiting_threads: self.waiting_threads.load(Ordering::Relaxed),
            max_wait_millis: self.max_wait_micros.load(Ordering::Relaxed) / 1_000,
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            physical_connects: self.physical_connects.load(Ordering::Relaxed),
            physical_closes: self.physical_closes.load(Ordering::Relaxed),
            running_statements: self.running_statements.load(Ordering::Relaxed),
            statement_concurrent_max: self.statement_concurrent_max.load(Ordering::Relaxed),
            statements,
        }
    }
}

/// Point-in-time copy of the collector.
#[derive(Debug, Clone)]
pub struct StatSnapshot {
    /// Connections currently borrowed.
    pub active_connections: u32,
    /// Callers currently blocked in acquire.
    pub waiting_threads: u32,
    /// Longest observed acquire wait.
    pub max_wait_millis: u64,
    /// Cumulative successful borrows.
    pub acquires: u64,
    /// Cumulative returns.
    pub releases: u64,
    /// Cumulative physical connects.
    pub physical_connects: u64,
    /// Cumulative physical closes.
    pub physical_closes: u64,
    /// Statements in flight right now.
    pub running_statements: u32,
    /// High-water mark of concurrent statement executions.
    pub statement_concurrent_max: u32,
    /// Per-fingerprint counters.
    pub statements: Vec<StatementSnapshot>,
}

/// Statistics filter.
///
/// Occupies a fixed position in the chain; wraps the onward call so it
/// observes failures raised by anything after it, including the terminal
/// driver operation, without altering control flow.
pub struct StatFilter {
    collector: Arc<StatCollector>,
    keyer: Arc<dyn StatementKeyer>,
}

impl StatFilter {
    /// Create a stat filter feeding the given collector, keyed by the
    /// default literal normalizer.
    #[must_use]
    pub fn new(collector: Arc<StatCollector>) -> Self {
        Self::with_keyer(collector, Arc::new(LiteralNormalizer::default()))
    }

    /// Create a stat filter with a custom statement keyer.
    #[must_use]
    pub fn with_keyer(collector: Arc<StatCollector>, keyer: Arc<dyn StatementKeyer>) -> Self {
        Self { collector, keyer }
    }

    /// The collector this filter feeds.
    #[must_use]
    pub fn collector(&self) -> &Arc<StatCollector> {
        &self.collector
    }

    async fn record<T>(&self, sql: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let stats = self.collector.stats_for(&self.keyer.fingerprint(sql));
        let _running = RunningGuard::enter(Arc::clone(&stats), Arc::clone(&self.collector));
        let started = Instant::now();
        let result = call.await;
        stats.finish(started.elapsed(), result.is_err());
        result
    }

    fn prepared_sql(stmt: &StatementProxy) -> String {
        stmt.sql().unwrap_or("<unprepared>").to_string()
    }
}

#[async_trait]
impl Filter for StatFilter {
    fn name(&self) -> &str {
        "stat"
    }

    async fn connection_connect(
        &self,
        chain: FilterChain<'_>,
        spec: &ConnectSpec,
    ) -> Result<Arc<ConnectionProxy>> {
        let result = chain.connection_connect(spec).await;
        if result.is_ok() {
            self.collector
                .physical_connects
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn connection_close(
        &self,
        chain: FilterChain<'_>,
        conn: &ConnectionProxy,
    ) -> Result<()> {
        self.collector
            .physical_closes
            .fetch_add(1, Ordering::Relaxed);
        chain.connection_close(conn).await
    }

    async fn statement_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        self.record(sql, chain.statement_execute(stmt, sql, params))
            .await
    }

    async fn statement_execute_update(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        self.record(sql, chain.statement_execute_update(stmt, sql, params))
            .await
    }

    async fn statement_execute_query(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        self.record(sql, chain.statement_execute_query(stmt, sql, params))
            .await
    }

    async fn statement_execute_batch(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        batch: &[String],
    ) -> Result<Vec<u64>> {
        // One record per batch, keyed by the joined statements.
        let joined = batch.join("; ");
        self.record(&joined, chain.statement_execute_batch(stmt, batch))
            .await
    }

    async fn prepared_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        let sql = Self::prepared_sql(stmt);
        self.record(&sql, chain.prepared_execute(stmt, params)).await
    }

    async fn prepared_execute_update(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        let sql = Self::prepared_sql(stmt);
        self.record(&sql, chain.prepared_execute_update(stmt, params))
            .await
    }

    async fn prepared_execute_query(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        let sql = Self::prepared_sql(stmt);
        self.record(&sql, chain.prepared_execute_query(stmt, params))
            .await
    }

    async fn data_source_acquire(
        &self,
        chain: FilterChain<'_>,
        pool: &dyn PoolFacade,
        timeout: Duration,
    ) -> Result<Arc<ConnectionProxy>> {
        let _waiting = WaitGuard::enter(Arc::clone(&self.collector));
        let started = Instant::now();
        let result = chain.data_source_acquire(pool, timeout).await;
        let waited = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        store_max_u64(&self.collector.max_wait_micros, waited);
        if result.is_ok() {
            self.collector.acquires.fetch_add(1, Ordering::Relaxed);
            self.collector
                .active_connections
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn data_source_release(
        &self,
        chain: FilterChain<'_>,
        pool: &dyn PoolFacade,
        conn: &ConnectionProxy,
    ) -> Result<()> {
        self.collector.releases.fetch_add(1, Ordering::Relaxed);
        dec_saturating(&self.collector.active_connections);
        chain.data_source_release(pool, conn).await
    }
}

impl std::fmt::Debug for StatFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatFilter").finish_non_exhaustive()
    }
}

/// Keeps the running-statement gauges balanced, including on panic.
struct RunningGuard {
    stats: Arc<StatementStats>,
    collector: Arc<StatCollector>,
}

impl RunningGuard {
    fn enter(stats: Arc<StatementStats>, collector: Arc<StatCollector>) -> Self {
        let per_stmt = stats.running.fetch_add(1, Ordering::Relaxed) + 1;
        store_max_u32(&stats.concurrent_max, per_stmt);
        let global = collector.running_statements.fetch_add(1, Ordering::Relaxed) + 1;
        store_max_u32(&collector.statement_concurrent_max, global);
        Self { stats, collector }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        dec_saturating(&self.stats.running);
        dec_saturating(&self.collector.running_statements);
    }
}

/// Keeps the wait-thread gauge balanced, including on panic.
struct WaitGuard {
    collector: Arc<StatCollector>,
}

impl WaitGuard {
    fn enter(collector: Arc<StatCollector>) -> Self {
        collector.waiting_threads.fetch_add(1, Ordering::Relaxed);
        Self { collector }
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        dec_saturating(&self.collector.waiting_threads);
    }
}

fn store_max_u64(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value > current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn store_max_u32(cell: &AtomicU32, value: u32) {
    let mut current = cell.load(Ordering::Relaxed);
    while value > current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn dec_saturating(cell: &AtomicU32) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_for_returns_same_entry() {
        let collector = StatCollector::new();
        let a = collector.stats_for("SELECT ?");
        let b = collector.stats_for("SELECT ?");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_finish_accumulates() {
        let stats = StatementStats::new("SELECT ?".into());
        stats.finish(Duration::from_millis(5), false);
        stats.finish(Duration::from_millis(9), true);

        let snap = stats.snapshot();
        assert_eq!(snap.execute_count, 2);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.total_millis, 14);
        assert_eq!(snap.max_millis, 9);
        assert!(snap.last_execute_unix_ms > 0);
    }

    #[test]
    fn test_running_guard_tracks_concurrent_max() {
        let collector = Arc::new(StatCollector::new());
        let stats = collector.stats_for("SELECT ?");

        let g1 = RunningGuard::enter(Arc::clone(&stats), Arc::clone(&collector));
        let g2 = RunningGuard::enter(Arc::clone(&stats), Arc::clone(&collector));
        assert_eq!(stats.snapshot().running, 2);
        drop(g1);
        drop(g2);

        let snap = stats.snapshot();
        assert_eq!(snap.running, 0);
        assert_eq!(snap.concurrent_max, 2);
        assert_eq!(collector.snapshot().statement_concurrent_max, 2);
    }

    #[test]
    fn test_dec_saturating_never_underflows() {
        let cell = AtomicU32::new(0);
        dec_saturating(&cell);
        assert_eq!(cell.load(Ordering::Relaxed), 0);
    }
}
