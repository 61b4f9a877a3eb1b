//! Connection holders.
//!
//! A holder owns one pooled physical connection (through its proxy) plus
//! the mutable metadata the pool manager needs: timestamps, use count,
//! discard flag and the optional prepared-statement cache. A holder is
//! never aliased: it moves from the idle deque into the borrowed table
//! and back, so its fields need no synchronization of their own.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;

use palisade_driver::DriverStatement;
use palisade_filter::ConnectionProxy;

/// One physical connection plus its pool-management metadata.
pub struct ConnectionHolder {
    id: u64,
    proxy: Arc<ConnectionProxy>,
    created_at: Instant,
    last_active_at: Instant,
    use_count: u64,
    discard: bool,
    stmt_cache: Option<LruCache<String, Arc<dyn DriverStatement>>>,
}

impl ConnectionHolder {
    /// Create a holder for a freshly connected proxy.
    #[must_use]
    pub fn new(id: u64, proxy: Arc<ConnectionProxy>, stmt_cache_size: Option<usize>) -> Self {
        let now = Instant::now();
        let stmt_cache = stmt_cache_size
            .and_then(NonZeroUsize::new)
            .map(LruCache::new);
        Self {
            id,
            proxy,
            created_at: now,
            last_active_at: now,
            use_count: 0,
            discard: false,
            stmt_cache,
        }
    }

    /// Holder id, unique and monotonic per pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The proxy wrapping this holder's physical connection.
    #[must_use]
    pub fn proxy(&self) -> &Arc<ConnectionProxy> {
        &self.proxy
    }

    /// When this connection was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How long the holder has sat since its last activity.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active_at)
    }

    /// Times this connection has been borrowed.
    #[must_use]
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Record a borrow.
    pub fn mark_borrowed(&mut self) {
        self.use_count += 1;
        self.last_active_at = Instant::now();
    }

    /// Record a return.
    pub fn touch(&mut self) {
        self.last_active_at = Instant::now();
    }

    /// Whether the holder is flagged for discard.
    #[must_use]
    pub fn is_discard(&self) -> bool {
        self.discard
    }

    /// Flag the holder for discard instead of reuse.
    pub fn mark_discard(&mut self) {
        self.discard = true;
    }

    /// Look up a cached prepared statement.
    pub fn cached_statement(&mut self, sql: &str) -> Option<Arc<dyn DriverStatement>> {
        self.stmt_cache.as_mut().and_then(|c| c.get(sql).cloned())
    }

    /// Cache a prepared statement, returning the evicted entry (if any) so
    /// the caller can close it.
    pub fn cache_statement(
        &mut self,
        sql: impl Into<String>,
        stmt: Arc<dyn DriverStatement>,
    ) -> Option<Arc<dyn DriverStatement>> {
        let cache = self.stmt_cache.as_mut()?;
        cache.push(sql.into(), stmt).map(|(_, evicted)| evicted)
    }

    /// Number of cached prepared statements.
    #[must_use]
    pub fn cached_statement_count(&self) -> usize {
        self.stmt_cache.as_ref().map_or(0, LruCache::len)
    }
}

impl std::fmt::Debug for ConnectionHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHolder")
            .field("id", &self.id)
            .field("connection_id", &self.proxy.id())
            .field("use_count", &self.use_count)
            .field("discard", &self.discard)
            .field("cached_statements", &self.cached_statement_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use palisade_driver::{DriverRows, Result, Value};
    use palisade_testing::MockDriver;

    struct FakeStatement(String);

    #[async_trait]
    impl DriverStatement for FakeStatement {
        fn sql(&self) -> &str {
            &self.0
        }
        async fn execute(&self, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }
        async fn query(&self, _params: &[Value]) -> Result<Box<dyn DriverRows>> {
            Err(palisade_driver::Error::operation("not supported"))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn holder_with_cache(size: usize) -> ConnectionHolder {
        let driver = MockDriver::new();
        let conn = palisade_driver::Driver::connect(
            &driver,
            &palisade_driver::ConnectSpec::new("mock://test"),
        )
        .await
        .unwrap();
        ConnectionHolder::new(1, Arc::new(ConnectionProxy::new(conn)), Some(size))
    }

    #[tokio::test]
    async fn test_borrow_bookkeeping() {
        let mut holder = holder_with_cache(2).await;
        assert_eq!(holder.use_count(), 0);
        holder.mark_borrowed();
        holder.mark_borrowed();
        assert_eq!(holder.use_count(), 2);
        assert!(!holder.is_discard());
        holder.mark_discard();
        assert!(holder.is_discard());
    }

    #[tokio::test]
    async fn test_statement_cache_lru_eviction() {
        let mut holder = holder_with_cache(2).await;

        assert!(
            holder
                .cache_statement("a", Arc::new(FakeStatement("a".into())))
                .is_none()
        );
        assert!(
            holder
                .cache_statement("b", Arc::new(FakeStatement("b".into())))
                .is_none()
        );
        // Touch "a" so "b" is the least recently used.
        assert!(holder.cached_statement("a").is_some());

        let evicted = holder.cache_statement("c", Arc::new(FakeStatement("c".into())));
        assert_eq!(evicted.map(|s| s.sql().to_string()), Some("b".to_string()));
        assert_eq!(holder.cached_statement_count(), 2);
        assert!(holder.cached_statement("b").is_none());
        assert!(holder.cached_statement("a").is_some());
    }

    #[tokio::test]
    async fn test_no_cache_when_disabled() {
        let mut holder = holder_with_cache(0).await;
        assert!(
            holder
                .cache_statement("a", Arc::new(FakeStatement("a".into())))
                .is_none()
        );
        assert!(holder.cached_statement("a").is_none());
        assert_eq!(holder.cached_statement_count(), 0);
    }
}
