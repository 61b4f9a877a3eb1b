//! The process-wide pool registry.
//!
//! Reporting surfaces (CLI, servlet, exporter) discover live pools here
//! and poll read-only snapshots. The registry holds weak handles only, so
//! it never extends a pool's lifetime. Pools register on creation and
//! deregister on shutdown; a process-global instance exists for
//! convenience, and an isolated instance can be injected through the pool
//! builder instead.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use palisade_filter::StatSnapshot;

use crate::pool::{PoolInner, PoolStats, PoolStatus};

static GLOBAL: Lazy<Arc<PoolRegistry>> = Lazy::new(|| Arc::new(PoolRegistry::new()));

/// Read-only snapshot of one registered pool.
#[derive(Debug, Clone)]
pub struct PoolReport {
    /// Pool name.
    pub name: String,
    /// Gauge snapshot.
    pub status: PoolStatus,
    /// Cumulative counters.
    pub stats: PoolStats,
    /// Statement statistics and pool-wide gauges from the stat filter.
    pub statements: StatSnapshot,
}

/// Registry of live pools in this process.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Weak<PoolInner>>>,
}

impl PoolRegistry {
    /// Create an isolated registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by pools built without an explicit
    /// one.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    pub(crate) fn register(&self, name: &str, inner: Weak<PoolInner>) {
        let mut pools = self.pools.lock();
        if pools
            .insert(name.to_string(), inner)
            .is_some_and(|old| old.upgrade().is_some())
        {
            tracing::warn!(pool = name, "replacing a live pool registration with the same name");
        }
    }

    pub(crate) fn deregister(&self, name: &str) {
        self.pools.lock().remove(name);
    }

    /// Names of the currently live pools.
    pub fn pool_names(&self) -> Vec<String> {
        let mut pools = self.pools.lock();
        pools.retain(|_, weak| weak.upgrade().is_some());
        pools.keys().cloned().collect()
    }

    /// Number of currently live pools.
    pub fn len(&self) -> usize {
        self.pool_names().len()
    }

    /// Whether no live pool is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot one pool by name.
    pub fn report(&self, name: &str) -> Option<PoolReport> {
        let inner = self.pools.lock().get(name)?.upgrade()?;
        Some(Self::report_for(&inner))
    }

    /// Snapshot every live pool.
    pub fn reports(&self) -> Vec<PoolReport> {
        let inners: Vec<Arc<PoolInner>> = {
            let mut pools = self.pools.lock();
            pools.retain(|_, weak| weak.upgrade().is_some());
            pools.values().filter_map(Weak::upgrade).collect()
        };
        inners.iter().map(|inner| Self::report_for(inner)).collect()
    }

    fn report_for(inner: &Arc<PoolInner>) -> PoolReport {
        PoolReport {
            name: inner.name.clone(),
            status: inner.status_snapshot(),
            stats: inner.stats_snapshot(),
            statements: inner.collector.snapshot(),
        }
    }
}
