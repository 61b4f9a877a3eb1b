//! The pool manager.
//!
//! Owns the idle deque, the borrowed table and the FIFO wait queue.
//! Borrow limits ride on a fair `tokio` semaphore: a borrower forgets its
//! permit, a release pushes the holder back and re-adds the permit, so the
//! longest-waiting borrower is always satisfied first. Acquisition and
//! release both travel through the filter chain's data-source events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use palisade_driver::{ConnectSpec, Driver, DriverStatement, Error, Result};
use palisade_filter::{
    ConnectionProxy, Filter, FilterPipeline, PoolFacade, SlowLogFilter, StatCollector, StatFilter,
    StatementKeyer, WallConfig, WallFilter,
};

use crate::config::PoolConfig;
use crate::conn::PooledConnection;
use crate::eviction;
use crate::holder::ConnectionHolder;
use crate::registry::PoolRegistry;

static NEXT_POOL_SEQ: AtomicU64 = AtomicU64::new(1);

/// A connection pool with an embedded interception pipeline.
///
/// Cheap to clone; all clones share the same pool state.
///
/// # Example
///
/// ```rust,ignore
/// use palisade_pool::{Pool, PoolConfig};
///
/// let pool = Pool::builder()
///     .driver(driver)
///     .connect_spec(ConnectSpec::new("postgres://localhost/app"))
///     .config(PoolConfig::new().min_idle(2).max_active(10))
///     .build()
///     .await?;
///
/// let conn = pool.acquire().await?;
/// conn.execute("DELETE FROM sessions WHERE expired", &[]).await?;
/// conn.close().await?;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct BorrowedEntry {
    pub(crate) holder: ConnectionHolder,
    pub(crate) borrowed_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) created: AtomicU64,
    pub(crate) closed: AtomicU64,
    pub(crate) discards: AtomicU64,
    pub(crate) acquire_timeouts: AtomicU64,
    pub(crate) leaks_reclaimed: AtomicU64,
    pub(crate) double_releases: AtomicU64,
}

pub(crate) struct PoolInner {
    pub(crate) name: String,
    pub(crate) config: PoolConfig,
    pub(crate) spec: ConnectSpec,
    pub(crate) pipeline: FilterPipeline,
    pub(crate) collector: Arc<StatCollector>,
    pub(crate) semaphore: Semaphore,
    pub(crate) idle: Mutex<VecDeque<ConnectionHolder>>,
    pub(crate) borrowed: Mutex<HashMap<u64, BorrowedEntry>>,
    pub(crate) total: AtomicU32,
    pub(crate) closed: AtomicBool,
    pub(crate) next_holder_id: AtomicU64,
    pub(crate) created_at: Instant,
    pub(crate) counters: PoolCounters,
    pub(crate) registry: Arc<PoolRegistry>,
    pub(crate) eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Name of this pool.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Borrow a connection, waiting up to the configured `max_wait`.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_with_timeout(self.inner.config.max_wait).await
    }

    /// Borrow a connection with an explicit wait budget.
    pub async fn acquire_with_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let proxy = self
            .inner
            .pipeline
            .data_source_acquire(&*self.inner, timeout)
            .await?;
        Ok(PooledConnection::new(proxy, Arc::clone(&self.inner)))
    }

    /// Current gauge snapshot.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.status_snapshot()
    }

    /// Cumulative counter snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats_snapshot()
    }

    /// The statistics collector fed by this pool's stat filter.
    #[must_use]
    pub fn stat_collector(&self) -> &Arc<StatCollector> {
        &self.inner.collector
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether the pool has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Run one eviction pass immediately, outside the recurring schedule.
    pub async fn evict_now(&self) {
        self.inner.evict_once().await;
    }

    /// Shut the pool down.
    ///
    /// Wakes every waiter with a pool-closed error, closes all idle
    /// connections, and deregisters from the registry. Borrowed
    /// connections are closed lazily when their borrowers release them.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        if let Some(task) = self.inner.eviction_task.lock().take() {
            task.abort();
        }
        let drained: Vec<ConnectionHolder> = self.inner.idle.lock().drain(..).collect();
        for holder in drained {
            self.inner.close_holder(holder).await;
        }
        self.inner.registry.deregister(&self.inner.name);
        tracing::info!(pool = %self.inner.name, "connection pool shut down");
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_holder_id(&self) -> u64 {
        self.next_holder_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve one live-connection slot against `max_active`.
    pub(crate) fn try_reserve_slot(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                (t < self.config.max_active).then_some(t + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_slot(&self) {
        let _ = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1));
    }

    /// Open a new physical connection through the chain's connect event.
    ///
    /// The caller must have reserved a slot; on error the caller releases it.
    pub(crate) async fn create_connection(&self) -> Result<ConnectionHolder> {
        let proxy = self.pipeline.connection_connect(&self.spec).await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        let cache = self
            .config
            .pool_prepared_statements
            .then_some(self.config.max_pool_prepared_statements_per_connection);
        let holder = ConnectionHolder::new(self.next_holder_id(), proxy, cache);
        tracing::debug!(
            pool = %self.name,
            connection_id = holder.proxy().id(),
            "physical connection created"
        );
        Ok(holder)
    }

    /// Run the validation probe against one connection.
    pub(crate) async fn probe(&self, proxy: &ConnectionProxy) -> bool {
        let query = self.config.validation_query.as_deref();
        match proxy.raw() {
            Ok(conn) => match conn.ping(query).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(connection_id = proxy.id(), error = %e, "validation probe failed");
                    false
                }
            },
            Err(_) => false,
        }
    }

    /// Physically close a holder, firing the chain's close event.
    pub(crate) async fn close_holder(&self, holder: ConnectionHolder) {
        self.release_slot();
        if let Err(e) = self.pipeline.connection_close(holder.proxy()).await {
            tracing::warn!(
                pool = %self.name,
                connection_id = holder.proxy().id(),
                error = %e,
                "error closing connection"
            );
        }
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) async fn discard_holder(&self, holder: ConnectionHolder, reason: &str) {
        self.counters.discards.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            pool = %self.name,
            connection_id = holder.proxy().id(),
            reason = reason,
            "discarding connection"
        );
        self.close_holder(holder).await;
    }

    async fn do_acquire(&self, timeout: Duration) -> Result<Arc<ConnectionProxy>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::PoolExhausted {
                    waited: started.elapsed(),
                });
            }
        };
        // The permit travels with the borrow and is re-added on release.
        permit.forget();

        loop {
            if self.is_closed() {
                self.semaphore.add_permits(1);
                return Err(Error::PoolClosed);
            }
            let popped = self.idle.lock().pop_front();
            match popped {
                Some(mut holder) => {
                    if holder.is_discard() || holder.proxy().is_closed() {
                        self.discard_holder(holder, "stale holder").await;
                        continue;
                    }
                    if self.config.test_on_borrow && !self.probe(holder.proxy()).await {
                        self.discard_holder(holder, "borrow validation failed").await;
                        continue;
                    }
                    return Ok(self.hand_out(holder));
                }
                None => {
                    if self.try_reserve_slot() {
                        match self.create_connection().await {
                            Ok(holder) => return Ok(self.hand_out(holder)),
                            Err(e) => {
                                self.release_slot();
                                self.semaphore.add_permits(1);
                                return Err(e);
                            }
                        }
                    }
                    // Every slot is live but none is idle: a concurrent
                    // release is about to push one back.
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    fn hand_out(&self, mut holder: ConnectionHolder) -> Arc<ConnectionProxy> {
        holder.mark_borrowed();
        let proxy = Arc::clone(holder.proxy());
        tracing::trace!(
            pool = %self.name,
            connection_id = proxy.id(),
            use_count = holder.use_count(),
            "connection borrowed"
        );
        self.borrowed.lock().insert(
            proxy.id(),
            BorrowedEntry {
                holder,
                borrowed_at: Instant::now(),
            },
        );
        proxy
    }

    async fn do_release(&self, conn: &ConnectionProxy) -> Result<()> {
        if conn.is_reclaimed() {
            tracing::warn!(
                pool = %self.name,
                connection_id = conn.id(),
                "release of a reclaimed connection; ignoring"
            );
            return Ok(());
        }

        let entry = self.borrowed.lock().remove(&conn.id());
        let Some(BorrowedEntry { mut holder, .. }) = entry else {
            self.counters.double_releases.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pool = %self.name,
                connection_id = conn.id(),
                "double release ignored"
            );
            return Ok(());
        };
        holder.touch();

        if self.is_closed() {
            // In-flight borrow returned after shutdown: close lazily.
            self.close_holder(holder).await;
            return Ok(());
        }

        let reusable = !holder.is_discard()
            && !conn.is_closed()
            && self.reset_for_reuse(conn).await
            && (!self.config.test_on_return || self.probe(conn).await);

        if reusable {
            // Push before re-adding the permit so the woken waiter finds it.
            self.idle.lock().push_back(holder);
        } else {
            self.discard_holder(holder, "not reusable on release").await;
        }
        self.semaphore.add_permits(1);
        Ok(())
    }

    /// Cheap state cleanup before a connection re-enters the idle set.
    async fn reset_for_reuse(&self, conn: &ConnectionProxy) -> bool {
        let raw = match conn.raw() {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        if let Err(e) = raw.rollback().await {
            tracing::warn!(connection_id = conn.id(), error = %e, "rollback on release failed");
            return false;
        }
        if let Err(e) = raw.clear_warnings().await {
            tracing::warn!(connection_id = conn.id(), error = %e, "clear warnings on release failed");
            return false;
        }
        true
    }

    /// Look up or create a prepared statement, going through the holder's
    /// LRU cache when statement pooling is enabled.
    pub(crate) async fn prepared_statement(
        &self,
        proxy: &Arc<ConnectionProxy>,
        sql: &str,
    ) -> Result<Arc<dyn DriverStatement>> {
        let cached = {
            let mut borrowed = self.borrowed.lock();
            borrowed
                .get_mut(&proxy.id())
                .and_then(|entry| entry.holder.cached_statement(sql))
        };
        if let Some(handle) = cached {
            tracing::trace!(connection_id = proxy.id(), "prepared statement cache hit");
            return Ok(handle);
        }

        let handle = proxy.raw()?.prepare(sql).await?;
        let evicted = {
            let mut borrowed = self.borrowed.lock();
            borrowed
                .get_mut(&proxy.id())
                .and_then(|entry| entry.holder.cache_statement(sql, Arc::clone(&handle)))
        };
        if let Some(old) = evicted {
            if let Err(e) = old.close().await {
                tracing::debug!(error = %e, "error closing evicted prepared statement");
            }
        }
        Ok(handle)
    }

    pub(crate) fn status_snapshot(&self) -> PoolStatus {
        PoolStatus {
            active: self.borrowed.lock().len() as u32,
            idle: self.idle.lock().len() as u32,
            waiters: self.collector.waiting_threads(),
            total: self.total.load(Ordering::Acquire),
            max_active: self.config.max_active,
        }
    }

    pub(crate) fn stats_snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.counters.created.load(Ordering::Relaxed),
            connections_closed: self.counters.closed.load(Ordering::Relaxed),
            discards: self.counters.discards.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
            leaks_reclaimed: self.counters.leaks_reclaimed.load(Ordering::Relaxed),
            double_releases: self.counters.double_releases.load(Ordering::Relaxed),
            uptime: self.created_at.elapsed(),
        }
    }
}

#[async_trait]
impl PoolFacade for PoolInner {
    fn pool_name(&self) -> &str {
        &self.name
    }

    async fn acquire_direct(&self, timeout: Duration) -> Result<Arc<ConnectionProxy>> {
        self.do_acquire(timeout).await
    }

    async fn release_direct(&self, conn: &ConnectionProxy) -> Result<()> {
        self.do_release(conn).await
    }
}

/// Gauge snapshot of the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Connections currently borrowed.
    pub active: u32,
    /// Connections sitting idle.
    pub idle: u32,
    /// Callers currently blocked in acquire.
    pub waiters: u32,
    /// Live connections (idle + borrowed, including in-progress creates).
    pub total: u32,
    /// Configured cap.
    pub max_active: u32,
}

impl PoolStatus {
    /// Borrowed share of the configured cap, as a percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_active == 0 {
            return 0.0;
        }
        f64::from(self.active) / f64::from(self.max_active) * 100.0
    }
}

/// Cumulative counter snapshot of the pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Physical connections created.
    pub connections_created: u64,
    /// Physical connections closed.
    pub connections_closed: u64,
    /// Connections discarded as broken, stale or failed validation.
    pub discards: u64,
    /// Acquire calls that failed with pool exhaustion.
    pub acquire_timeouts: u64,
    /// Abandoned borrows forcibly reclaimed.
    pub leaks_reclaimed: u64,
    /// Benign double releases observed.
    pub double_releases: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

/// Builder for [`Pool`].
pub struct PoolBuilder {
    name: Option<String>,
    spec: Option<ConnectSpec>,
    config: PoolConfig,
    driver: Option<Arc<dyn Driver>>,
    wall: Option<WallConfig>,
    slow_log_threshold: Option<Duration>,
    custom_filters: Vec<Arc<dyn Filter>>,
    keyer: Option<Arc<dyn StatementKeyer>>,
    collector: Option<Arc<StatCollector>>,
    registry: Option<Arc<PoolRegistry>>,
}

impl PoolBuilder {
    /// Create a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: None,
            spec: None,
            config: PoolConfig::default(),
            driver: None,
            wall: None,
            slow_log_threshold: None,
            custom_filters: Vec::new(),
            keyer: None,
            collector: None,
            registry: None,
        }
    }

    /// Set the pool name used in logs, stats and the registry.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the driver that opens physical connections.
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the connect spec handed to the driver.
    #[must_use]
    pub fn connect_spec(mut self, spec: ConnectSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable the SQL wall with the given rule configuration.
    #[must_use]
    pub fn wall(mut self, config: WallConfig) -> Self {
        self.wall = Some(config);
        self
    }

    /// Enable the slow-statement log with the given threshold.
    #[must_use]
    pub fn slow_log_threshold(mut self, threshold: Duration) -> Self {
        self.slow_log_threshold = Some(threshold);
        self
    }

    /// Append a custom filter.
    ///
    /// Custom filters run after the built-in ones, so the stat filter
    /// observes their outcomes.
    #[must_use]
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.custom_filters.push(filter);
        self
    }

    /// Replace the default statement keyer used for statistics.
    #[must_use]
    pub fn statement_keyer(mut self, keyer: Arc<dyn StatementKeyer>) -> Self {
        self.keyer = Some(keyer);
        self
    }

    /// Feed statistics into an existing collector.
    #[must_use]
    pub fn stat_collector(mut self, collector: Arc<StatCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Register in a specific registry instead of the process-wide one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<PoolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the pool: validate configuration, assemble the filter
    /// pipeline, warm up `min_idle` connections and start the eviction
    /// scheduler.
    pub async fn build(self) -> Result<Pool> {
        self.config.validate()?;
        let driver = self
            .driver
            .ok_or_else(|| Error::config("pool builder requires a driver"))?;
        let spec = self
            .spec
            .ok_or_else(|| Error::config("pool builder requires a connect spec"))?;
        let name = self
            .name
            .unwrap_or_else(|| format!("pool-{}", NEXT_POOL_SEQ.fetch_add(1, Ordering::Relaxed)));
        let collector = self.collector.unwrap_or_default();
        let registry = self.registry.unwrap_or_else(PoolRegistry::global);

        let mut filters: Vec<Arc<dyn Filter>> = Vec::new();
        if let Some(wall) = self.wall {
            filters.push(Arc::new(WallFilter::new(wall)?));
        }
        filters.push(Arc::new(match self.keyer {
            Some(keyer) => StatFilter::with_keyer(Arc::clone(&collector), keyer),
            None => StatFilter::new(Arc::clone(&collector)),
        }));
        if let Some(threshold) = self.slow_log_threshold {
            filters.push(Arc::new(SlowLogFilter::new(threshold)));
        }
        filters.extend(self.custom_filters);

        let max_active = self.config.max_active;
        let inner = Arc::new(PoolInner {
            name,
            spec,
            pipeline: FilterPipeline::new(filters, driver),
            collector,
            semaphore: Semaphore::new(max_active as usize),
            idle: Mutex::new(VecDeque::with_capacity(max_active as usize)),
            borrowed: Mutex::new(HashMap::new()),
            total: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            next_holder_id: AtomicU64::new(1),
            created_at: Instant::now(),
            counters: PoolCounters::default(),
            registry,
            eviction_task: Mutex::new(None),
            config: self.config,
        });

        // Warm up to min_idle; creation failures are logged, not fatal.
        // The eviction scheduler retries on its own schedule.
        for _ in 0..inner.config.min_idle {
            if !inner.try_reserve_slot() {
                break;
            }
            match inner.create_connection().await {
                Ok(holder) => inner.idle.lock().push_back(holder),
                Err(e) => {
                    inner.release_slot();
                    tracing::warn!(pool = %inner.name, error = %e, "initial connection failed");
                    break;
                }
            }
        }

        if !inner.config.time_between_eviction_runs.is_zero() {
            let task = eviction::spawn(&inner);
            *inner.eviction_task.lock() = Some(task);
        }

        inner.registry.register(&inner.name, Arc::downgrade(&inner));
        tracing::info!(
            pool = %inner.name,
            min_idle = inner.config.min_idle,
            max_active = inner.config.max_active,
            filters = ?inner.pipeline.filter_names(),
            "connection pool created"
        );

        Ok(Pool { inner })
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
