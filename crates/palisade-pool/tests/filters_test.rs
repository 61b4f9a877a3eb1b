//! Pool + filter integration: statistics, wall, statement cache, registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use palisade_driver::{ConnectSpec, Driver, Error, ErrorKind, Result, Value};
use palisade_filter::{Filter, FilterChain, PoolFacade, StatementProxy, WallConfig};
use palisade_pool::{Pool, PoolConfig, PoolRegistry};
use palisade_testing::{MockDriver, MockOutcome};

fn quiet_config() -> PoolConfig {
    PoolConfig::new().time_between_eviction_runs(Duration::ZERO)
}

#[tokio::test]
async fn test_statement_stats_keyed_by_fingerprint() {
    let driver = Arc::new(MockDriver::new());
    let pool = Pool::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(quiet_config().min_idle(0).max_active(2))
        .build()
        .await
        .expect("pool");

    let conn = pool.acquire().await.expect("acquire");
    conn.execute("UPDATE t SET x = 1", &[]).await.expect("1");
    conn.execute("UPDATE t SET x = 2", &[]).await.expect("2");
    conn.execute("UPDATE t SET x = 999", &[]).await.expect("3");
    conn.close().await.expect("release");

    let stats = pool
        .stat_collector()
        .statement("UPDATE t SET x = ?")
        .expect("one bucket for all three literals");
    assert_eq!(stats.execute_count(), 3);
    assert_eq!(stats.error_count(), 0);

    let snapshot = pool.stat_collector().snapshot();
    assert_eq!(snapshot.acquires, 1);
    assert_eq!(snapshot.releases, 1);
    assert_eq!(snapshot.physical_connects, 1);
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(snapshot.waiting_threads, 0);
}

/// A rejection filter positioned after the stat filter, as custom filters
/// are: its vetoes land in the statement's error count.
struct DropTableVeto;

#[async_trait]
impl Filter for DropTableVeto {
    fn name(&self) -> &str {
        "drop-veto"
    }

    async fn statement_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        if sql.starts_with("DROP TABLE") {
            return Err(Error::operation_with_sql("drop rejected", sql));
        }
        chain.statement_execute(stmt, sql, params).await
    }
}

#[tokio::test]
async fn test_custom_veto_error_reaches_caller_and_stats() {
    let driver = Arc::new(MockDriver::new());
    let pool = Pool::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(quiet_config().min_idle(0).max_active(1))
        .filter(Arc::new(DropTableVeto))
        .build()
        .await
        .expect("pool");

    let conn = pool.acquire().await.expect("acquire");
    let err = conn
        .execute("DROP TABLE x", &[])
        .await
        .expect_err("veto reaches the caller");
    assert_eq!(err.kind(), ErrorKind::Operation);
    assert!(err.to_string().contains("drop rejected"));
    conn.close().await.expect("release");

    let stats = pool
        .stat_collector()
        .statement("DROP TABLE x")
        .expect("fingerprint recorded");
    assert_eq!(stats.execute_count(), 1);
    assert_eq!(stats.error_count(), 1);
    assert_eq!(driver.execute_count(), 0, "the real operation never ran");
}

#[tokio::test]
async fn test_wall_blocks_and_bypasses_statement_stats() {
    let driver = Arc::new(MockDriver::new());
    let pool = Pool::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(quiet_config().min_idle(0).max_active(1))
        .wall(WallConfig::default().block_ddl(true))
        .build()
        .await
        .expect("pool");

    let conn = pool.acquire().await.expect("acquire");
    let err = conn
        .execute("TRUNCATE audit_log", &[])
        .await
        .expect_err("wall blocks ddl");
    assert_eq!(err.kind(), ErrorKind::Operation);
    assert!(err.to_string().contains("wall rejected"));

    // The wall sits ahead of the stat filter, so blocked statements do not
    // pollute the latency table.
    assert!(
        pool.stat_collector()
            .statement("TRUNCATE audit_log")
            .is_none()
    );

    conn.execute("SELECT * FROM audit_log", &[])
        .await
        .expect("reads pass the wall");
    conn.close().await.expect("release");
}

#[tokio::test]
async fn test_prepared_statement_cache_hits_and_evicts() {
    let driver = Arc::new(MockDriver::new());
    let pool = Pool::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(
            quiet_config()
                .min_idle(0)
                .max_active(1)
                .pool_prepared_statements(2),
        )
        .build()
        .await
        .expect("pool");

    let conn = pool.acquire().await.expect("acquire");

    let s1 = conn.prepare("SELECT a FROM t WHERE id = ?").await.expect("s1");
    s1.execute(&[Value::Int(1)]).await.expect("run");
    assert_eq!(driver.prepare_count(), 1);

    // Same SQL again: served from the holder's cache.
    let s1b = conn.prepare("SELECT a FROM t WHERE id = ?").await.expect("s1b");
    s1b.execute(&[Value::Int(2)]).await.expect("run");
    assert_eq!(driver.prepare_count(), 1);

    // Two more distinct statements overflow the cache of 2 and evict the
    // least recently used entry.
    conn.prepare("SELECT b FROM t").await.expect("s2");
    conn.prepare("SELECT c FROM t").await.expect("s3");
    assert_eq!(driver.prepare_count(), 3);

    conn.prepare("SELECT a FROM t WHERE id = ?").await.expect("re-prepare");
    assert_eq!(driver.prepare_count(), 4, "evicted entry is prepared again");

    conn.close().await.expect("release");
}

#[tokio::test]
async fn test_cache_survives_release_and_reacquire() {
    let driver = Arc::new(MockDriver::new());
    let pool = Pool::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(
            quiet_config()
                .min_idle(0)
                .max_active(1)
                .pool_prepared_statements(4),
        )
        .build()
        .await
        .expect("pool");

    let conn = pool.acquire().await.expect("first borrow");
    conn.prepare("SELECT 1").await.expect("prepare");
    assert_eq!(driver.prepare_count(), 1);
    conn.close().await.expect("release");

    let conn = pool.acquire().await.expect("same holder again");
    conn.prepare("SELECT 1").await.expect("cache hit");
    assert_eq!(driver.prepare_count(), 1, "preparation reused across borrows");
    conn.close().await.expect("release");
}

/// A misbehaving filter that releases directly and then forwards, forcing
/// the pool to see the same connection returned twice.
struct DoubleReleaser;

#[async_trait]
impl Filter for DoubleReleaser {
    fn name(&self) -> &str {
        "double-release"
    }

    async fn data_source_release(
        &self,
        chain: FilterChain<'_>,
        pool: &dyn PoolFacade,
        conn: &palisade_filter::ConnectionProxy,
    ) -> Result<()> {
        pool.release_direct(conn).await?;
        chain.data_source_release(pool, conn).await
    }
}

#[tokio::test]
async fn test_double_release_is_a_benign_warning() {
    let driver = Arc::new(MockDriver::new());
    let pool = Pool::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(quiet_config().min_idle(0).max_active(1))
        .filter(Arc::new(DoubleReleaser))
        .build()
        .await
        .expect("pool");

    let conn = pool.acquire().await.expect("acquire");
    conn.close().await.expect("double release still returns Ok");

    assert_eq!(pool.stats().double_releases, 1);
    let status = pool.status();
    assert_eq!(status.active, 0);
    assert_eq!(status.idle, 1, "holder returned exactly once");

    // Pool state is not corrupted: the connection can be borrowed again.
    let conn = pool.acquire().await.expect("reborrow");
    conn.close().await.expect("release");
}

#[tokio::test]
async fn test_registry_lifecycle() {
    let registry = Arc::new(PoolRegistry::new());
    let driver = Arc::new(MockDriver::new());
    let pool = Pool::builder()
        .name("reporting-db")
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(quiet_config().min_idle(1).max_active(2))
        .registry(Arc::clone(&registry))
        .build()
        .await
        .expect("pool");

    assert_eq!(registry.pool_names(), vec!["reporting-db".to_string()]);

    let conn = pool.acquire().await.expect("acquire");
    conn.execute("SELECT 1", &[]).await.expect("execute");

    let report = registry.report("reporting-db").expect("report");
    assert_eq!(report.status.active, 1);
    assert_eq!(report.statements.acquires, 1);
    assert!(
        report
            .statements
            .statements
            .iter()
            .any(|s| s.fingerprint == "SELECT ?")
    );

    conn.close().await.expect("release");
    pool.shutdown().await;
    assert!(registry.is_empty(), "shutdown deregisters the pool");
    assert!(registry.report("reporting-db").is_none());
}

#[tokio::test]
async fn test_slow_statement_marked_on_prepared_proxy() {
    let driver = Arc::new(MockDriver::new());
    driver.set_execute_delay(Duration::from_millis(30));
    let pool = Pool::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(quiet_config().min_idle(0).max_active(1))
        .slow_log_threshold(Duration::from_millis(5))
        .build()
        .await
        .expect("pool");

    let conn = pool.acquire().await.expect("acquire");
    let stmt = conn.prepare("SELECT pg_sleep(?)").await.expect("prepare");
    stmt.execute(&[Value::Int(1)]).await.expect("slow execute");

    assert!(
        stmt.attributes()
            .get(palisade_filter::slowlog::ATTR_SLOW_MILLIS)
            .is_some(),
        "slow statement marked in the attribute bag"
    );
    conn.close().await.expect("release");
}

#[tokio::test]
async fn test_query_rows_round_trip_through_pool() {
    let driver = Arc::new(MockDriver::new());
    driver.script(
        "SELECT id, name FROM users",
        MockOutcome::rows(
            &["id", "name"],
            vec![
                vec![Value::Int(1), Value::from("alice")],
                vec![Value::Int(2), Value::from("bob")],
            ],
        ),
    );
    let pool = Pool::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .connect_spec(ConnectSpec::new("mock://test"))
        .config(quiet_config().min_idle(0).max_active(1))
        .build()
        .await
        .expect("pool");

    let conn = pool.acquire().await.expect("acquire");
    let rows = conn
        .execute_query("SELECT id, name FROM users", &[])
        .await
        .expect("query")
        .collect()
        .await
        .expect("rows");

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_named("name"), Some(&Value::from("alice")));
    assert_eq!(rows[1].get_named("id"), Some(&Value::Int(2)));
    conn.close().await.expect("release");
}
