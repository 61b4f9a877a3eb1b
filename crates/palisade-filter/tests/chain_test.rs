//! Filter chain determinism and error-propagation tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use palisade_driver::{ConnectSpec, Error, ErrorKind, Result, Value};
use palisade_filter::{
    AttrValue, ConnectionProxy, Filter, FilterChain, FilterPipeline, ResultSetProxy, StatCollector,
    StatFilter, StatementProxy, WallConfig, WallFilter,
};
use palisade_testing::{MockDriver, MockOutcome};

/// Records every interception point it sees, in order.
struct RecordingFilter {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingFilter {
    fn new(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { label, log })
    }

    fn record(&self, op: &str) {
        self.log.lock().push(format!("{}:{}", self.label, op));
    }
}

#[async_trait]
impl Filter for RecordingFilter {
    fn name(&self) -> &str {
        self.label
    }

    async fn connection_connect(
        &self,
        chain: FilterChain<'_>,
        spec: &ConnectSpec,
    ) -> Result<Arc<ConnectionProxy>> {
        self.record("connect");
        chain.connection_connect(spec).await
    }

    async fn statement_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        self.record("execute");
        chain.statement_execute(stmt, sql, params).await
    }

    async fn result_set_next(
        &self,
        chain: FilterChain<'_>,
        rs: &mut ResultSetProxy,
    ) -> Result<Option<palisade_driver::Row>> {
        self.record("next");
        chain.result_set_next(rs).await
    }
}

/// Rejects every statement without calling onward.
struct VetoFilter;

#[async_trait]
impl Filter for VetoFilter {
    fn name(&self) -> &str {
        "veto"
    }

    async fn statement_execute(
        &self,
        _chain: FilterChain<'_>,
        _stmt: &StatementProxy,
        sql: &str,
        _params: &[Value],
    ) -> Result<u64> {
        Err(Error::operation_with_sql("vetoed", sql))
    }
}

async fn connect(pipeline: &FilterPipeline) -> Arc<ConnectionProxy> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    pipeline
        .connection_connect(&ConnectSpec::new("mock://test"))
        .await
        .expect("connect")
}

#[tokio::test]
async fn test_filters_run_in_order_and_terminal_runs_once() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let driver = Arc::new(MockDriver::new());
    let pipeline = FilterPipeline::new(
        vec![
            RecordingFilter::new("a", Arc::clone(&log)),
            RecordingFilter::new("b", Arc::clone(&log)),
            RecordingFilter::new("c", Arc::clone(&log)),
        ],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));
    let affected = pipeline
        .statement_execute(&stmt, "UPDATE t SET x = 1", &[])
        .await
        .expect("execute");

    assert_eq!(affected, 1);
    assert_eq!(
        log.lock().clone(),
        vec![
            "a:connect",
            "b:connect",
            "c:connect",
            "a:execute",
            "b:execute",
            "c:execute",
        ]
    );
    // The terminal driver call ran exactly once.
    assert_eq!(driver.execute_count(), 1);
}

#[tokio::test]
async fn test_short_circuit_skips_terminal() {
    let driver = Arc::new(MockDriver::new());
    let pipeline = FilterPipeline::new(
        vec![Arc::new(VetoFilter)],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));
    let err = pipeline
        .statement_execute(&stmt, "DELETE FROM t", &[])
        .await
        .expect_err("veto");

    assert_eq!(err.kind(), ErrorKind::Operation);
    assert_eq!(driver.execute_count(), 0);
}

#[tokio::test]
async fn test_terminal_error_propagates_through_filters_unchanged() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let driver = Arc::new(MockDriver::new());
    driver.script("SELECT boom", MockOutcome::Fail("table missing".into()));
    let pipeline = FilterPipeline::new(
        vec![RecordingFilter::new("a", Arc::clone(&log))],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));
    let err = pipeline
        .statement_execute(&stmt, "SELECT boom", &[])
        .await
        .expect_err("scripted failure");

    assert!(err.to_string().contains("table missing"));
    // The observer still saw its before-notification.
    assert!(log.lock().iter().any(|e| e == "a:execute"));
}

#[tokio::test]
async fn test_stat_filter_counts_failures_from_later_filters() {
    // Stat ahead of the thrower: its wrap-around bookkeeping must record
    // the failure exactly once and rethrow unchanged.
    let collector = Arc::new(StatCollector::new());
    let driver = Arc::new(MockDriver::new());
    let pipeline = FilterPipeline::new(
        vec![
            Arc::new(StatFilter::new(Arc::clone(&collector))),
            Arc::new(VetoFilter),
        ],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));
    let err = pipeline
        .statement_execute(&stmt, "DROP TABLE x", &[])
        .await
        .expect_err("vetoed");
    assert_eq!(err.kind(), ErrorKind::Operation);

    let stats = collector.statement("DROP TABLE x").expect("fingerprint");
    assert_eq!(stats.execute_count(), 1);
    assert_eq!(stats.error_count(), 1);
    let snap = stats.snapshot();
    assert_eq!(snap.running, 0);
    assert_eq!(snap.concurrent_max, 1);
}

#[tokio::test]
async fn test_stat_filter_counts_terminal_failures() {
    let collector = Arc::new(StatCollector::new());
    let driver = Arc::new(MockDriver::new());
    driver.script("SELECT boom", MockOutcome::Fail("nope".into()));
    let pipeline = FilterPipeline::new(
        vec![Arc::new(StatFilter::new(Arc::clone(&collector)))],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));

    assert!(
        pipeline
            .statement_execute(&stmt, "SELECT boom", &[])
            .await
            .is_err()
    );
    assert!(
        pipeline
            .statement_execute(&stmt, "UPDATE t SET x = 2", &[])
            .await
            .is_ok()
    );

    let failed = collector.statement("SELECT boom").expect("fingerprint");
    assert_eq!(failed.execute_count(), 1);
    assert_eq!(failed.error_count(), 1);

    let ok = collector
        .statement("UPDATE t SET x = ?")
        .expect("normalized fingerprint");
    assert_eq!(ok.execute_count(), 1);
    assert_eq!(ok.error_count(), 0);
}

#[tokio::test]
async fn test_wall_blocks_before_terminal() {
    let driver = Arc::new(MockDriver::new());
    let wall = WallFilter::new(WallConfig::default().block_ddl(true)).expect("wall");
    let pipeline = FilterPipeline::new(
        vec![Arc::new(wall)],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));
    let err = pipeline
        .statement_execute(&stmt, "DROP TABLE users", &[])
        .await
        .expect_err("blocked");

    assert_eq!(err.kind(), ErrorKind::Operation);
    assert!(err.to_string().contains("wall rejected"));
    assert_eq!(driver.execute_count(), 0);
}

#[tokio::test]
async fn test_result_set_flows_through_chain() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let driver = Arc::new(MockDriver::new());
    driver.script(
        "SELECT id FROM t",
        MockOutcome::rows(&["id"], vec![vec![Value::Int(1)], vec![Value::Int(2)]]),
    );
    let pipeline = FilterPipeline::new(
        vec![RecordingFilter::new("a", Arc::clone(&log))],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));
    let mut rs = pipeline
        .statement_execute_query(&stmt, "SELECT id FROM t", &[])
        .await
        .expect("query");

    assert_eq!(rs.statement_id(), stmt.id());
    assert!(pipeline.result_set_next(&mut rs).await.expect("row 1").is_some());
    assert!(pipeline.result_set_next(&mut rs).await.expect("row 2").is_some());
    assert!(pipeline.result_set_next(&mut rs).await.expect("drained").is_none());
    assert_eq!(rs.row_count(), 2);

    pipeline.result_set_close(&mut rs).await.expect("close");
    // Closed cursors fail fast.
    assert!(pipeline.result_set_next(&mut rs).await.is_err());
    assert_eq!(log.lock().iter().filter(|e| *e == "a:next").count(), 3);
}

#[tokio::test]
async fn test_prepared_statement_through_chain() {
    let collector = Arc::new(StatCollector::new());
    let driver = Arc::new(MockDriver::new());
    driver.script("INSERT INTO t VALUES (?)", MockOutcome::Affected(1));
    let pipeline = FilterPipeline::new(
        vec![Arc::new(StatFilter::new(Arc::clone(&collector)))],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let raw = conn.raw().expect("live connection");
    let handle = raw.prepare("INSERT INTO t VALUES (?)").await.expect("prepare");
    let stmt = StatementProxy::prepared(Arc::clone(&conn), handle);

    let affected = pipeline
        .prepared_execute(&stmt, &[Value::Int(5)])
        .await
        .expect("execute");
    assert_eq!(affected, 1);

    let stats = collector
        .statement("INSERT INTO t VALUES (?)")
        .expect("fingerprint");
    assert_eq!(stats.execute_count(), 1);
}

#[tokio::test]
async fn test_attribute_bag_crosses_filters() {
    struct Setter;
    struct Reader {
        seen: Arc<Mutex<Option<AttrValue>>>,
    }

    #[async_trait]
    impl Filter for Setter {
        fn name(&self) -> &str {
            "setter"
        }
        async fn statement_execute(
            &self,
            chain: FilterChain<'_>,
            stmt: &StatementProxy,
            sql: &str,
            params: &[Value],
        ) -> Result<u64> {
            stmt.attributes().set("audit.user", AttrValue::Text("svc".into()));
            chain.statement_execute(stmt, sql, params).await
        }
    }

    #[async_trait]
    impl Filter for Reader {
        fn name(&self) -> &str {
            "reader"
        }
        async fn statement_execute(
            &self,
            chain: FilterChain<'_>,
            stmt: &StatementProxy,
            sql: &str,
            params: &[Value],
        ) -> Result<u64> {
            *self.seen.lock() = stmt.attributes().get("audit.user");
            chain.statement_execute(stmt, sql, params).await
        }
    }

    let seen = Arc::new(Mutex::new(None));
    let driver = Arc::new(MockDriver::new());
    let pipeline = FilterPipeline::new(
        vec![
            Arc::new(Setter),
            Arc::new(Reader {
                seen: Arc::clone(&seen),
            }),
        ],
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));
    pipeline
        .statement_execute(&stmt, "SELECT 1", &[])
        .await
        .expect("execute");

    assert_eq!(seen.lock().clone(), Some(AttrValue::Text("svc".into())));
}

#[tokio::test]
async fn test_closed_connection_proxy_fails_fast() {
    let driver = Arc::new(MockDriver::new());
    let pipeline = FilterPipeline::new(
        Vec::new(),
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));

    pipeline.connection_close(&conn).await.expect("close");
    assert!(conn.is_closed());
    // Close is idempotent at the driver boundary.
    pipeline.connection_close(&conn).await.expect("second close");
    assert_eq!(driver.close_count(), 1);

    let err = pipeline
        .statement_execute(&stmt, "SELECT 1", &[])
        .await
        .expect_err("proxy invalidated");
    assert_eq!(err.kind(), ErrorKind::Operation);
}

#[tokio::test]
async fn test_batch_executes_each_statement() {
    let driver = Arc::new(MockDriver::new());
    driver.script("UPDATE a SET x = 1", MockOutcome::Affected(3));
    driver.script("UPDATE b SET x = 1", MockOutcome::Affected(4));
    let pipeline = FilterPipeline::new(
        Vec::new(),
        Arc::clone(&driver) as Arc<dyn palisade_driver::Driver>,
    );

    let conn = connect(&pipeline).await;
    let stmt = StatementProxy::direct(Arc::clone(&conn));
    let counts = pipeline
        .statement_execute_batch(
            &stmt,
            &["UPDATE a SET x = 1".to_string(), "UPDATE b SET x = 1".to_string()],
        )
        .await
        .expect("batch");

    assert_eq!(counts, vec![3, 4]);
    assert_eq!(driver.execute_count(), 2);
}
