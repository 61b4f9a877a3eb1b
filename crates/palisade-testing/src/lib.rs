//! # palisade-testing
//!
//! Mock driver for palisade development.
//!
//! [`MockDriver`] implements the full driver SPI against in-memory state:
//! tests script per-statement outcomes, inject connect failures and
//! latency, flip the validation probe, and read back operation counters.
//!
//! ## Example
//!
//! ```rust,ignore
//! let driver = Arc::new(MockDriver::new());
//! driver.script("SELECT * FROM users", MockOutcome::rows(
//!     &["id", "name"],
//!     vec![vec![Value::Int(1), Value::from("alice")]],
//! ));
//! driver.fail_next_connects(1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use palisade_driver::{
    ConnectSpec, Driver, DriverConnection, DriverRows, DriverStatement, Error, Result, Row, Value,
};

/// Scripted behavior for one statement.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with an affected-row count.
    Affected(u64),
    /// Succeed with a result set.
    Rows {
        /// Column names.
        columns: Vec<String>,
        /// Row values, one `Vec<Value>` per row.
        rows: Vec<Vec<Value>>,
    },
    /// Fail with an operation error.
    Fail(String),
}

impl MockOutcome {
    /// Convenience constructor for a result set.
    #[must_use]
    pub fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::Rows {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows,
        }
    }
}

#[derive(Debug, Default)]
struct MockShared {
    outcomes: Mutex<HashMap<String, MockOutcome>>,
    connect_failures: AtomicU32,
    ping_healthy: AtomicBool,
    execute_delay: Mutex<Option<Duration>>,

    connects: AtomicU64,
    closes: AtomicU64,
    executes: AtomicU64,
    prepares: AtomicU64,
    pings: AtomicU64,
    rollbacks: AtomicU64,
    warning_clears: AtomicU64,
}

/// In-memory driver with scriptable behavior.
#[derive(Debug)]
pub struct MockDriver {
    shared: Arc<MockShared>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a driver with a healthy probe and no scripted statements.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(MockShared::default());
        shared.ping_healthy.store(true, Ordering::Relaxed);
        Self { shared }
    }

    /// Script the outcome of one exact statement text.
    pub fn script(&self, sql: impl Into<String>, outcome: MockOutcome) {
        self.shared.outcomes.lock().insert(sql.into(), outcome);
    }

    /// Make the next `n` connect attempts fail with a connectivity error.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.connect_failures.store(n, Ordering::Relaxed);
    }

    /// Flip the validation probe for every connection of this driver.
    pub fn set_ping_healthy(&self, healthy: bool) {
        self.shared.ping_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Delay injected into every execute/query call.
    pub fn set_execute_delay(&self, delay: Duration) {
        *self.shared.execute_delay.lock() = Some(delay);
    }

    /// Physical connections opened.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Physical connections closed.
    #[must_use]
    pub fn close_count(&self) -> u64 {
        self.shared.closes.load(Ordering::Relaxed)
    }

    /// Statements executed (direct, prepared and batch items).
    #[must_use]
    pub fn execute_count(&self) -> u64 {
        self.shared.executes.load(Ordering::Relaxed)
    }

    /// Statements prepared (cache hits in the pool never reach this).
    #[must_use]
    pub fn prepare_count(&self) -> u64 {
        self.shared.prepares.load(Ordering::Relaxed)
    }

    /// Validation probes run.
    #[must_use]
    pub fn ping_count(&self) -> u64 {
        self.shared.pings.load(Ordering::Relaxed)
    }

    /// Rollbacks performed (connection reset on release).
    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::Relaxed)
    }

    /// Warning clears performed (connection reset on release).
    #[must_use]
    pub fn warning_clear_count(&self) -> u64 {
        self.shared.warning_clears.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self, spec: &ConnectSpec) -> Result<Box<dyn DriverConnection>> {
        let remaining =
            self.shared
                .connect_failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        if remaining.is_ok() {
            return Err(Error::connectivity(format!(
                "mock connect refused for {}",
                spec.url
            )));
        }
        self.shared.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockConnection {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockConnection {
    shared: Arc<MockShared>,
    closed: AtomicBool,
}

/// A scripted outcome with the failure case already raised.
enum Ran {
    Affected(u64),
    Rows(Vec<String>, Vec<Vec<Value>>),
}

impl MockShared {
    async fn run(&self, sql: &str) -> Result<Ran> {
        let delay = *self.execute_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.executes.fetch_add(1, Ordering::Relaxed);
        let outcome = self
            .outcomes
            .lock()
            .get(sql)
            .cloned()
            .unwrap_or(MockOutcome::Affected(1));
        match outcome {
            MockOutcome::Fail(message) => Err(Error::operation_with_sql(message, sql)),
            MockOutcome::Affected(n) => Ok(Ran::Affected(n)),
            MockOutcome::Rows { columns, rows } => Ok(Ran::Rows(columns, rows)),
        }
    }
}

impl MockConnection {
    fn guard(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::operation("mock connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.guard()?;
        match self.shared.run(sql).await? {
            Ran::Affected(n) => Ok(n),
            Ran::Rows(_, rows) => Ok(rows.len() as u64),
        }
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Box<dyn DriverRows>> {
        self.guard()?;
        match self.shared.run(sql).await? {
            Ran::Rows(columns, rows) => Ok(Box::new(MockRows::new(columns, rows))),
            Ran::Affected(_) => Ok(Box::new(MockRows::empty())),
        }
    }

    async fn prepare(&self, sql: &str) -> Result<Arc<dyn DriverStatement>> {
        self.guard()?;
        self.shared.prepares.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockStatement {
            sql: sql.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn ping(&self, _validation_query: Option<&str>) -> Result<()> {
        self.guard()?;
        self.shared.pings.fetch_add(1, Ordering::Relaxed);
        if self.shared.ping_healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::connectivity("mock probe unhealthy"))
        }
    }

    async fn rollback(&self) -> Result<()> {
        self.guard()?;
        self.shared.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear_warnings(&self) -> Result<()> {
        self.guard()?;
        self.shared.warning_clears.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.closes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

struct MockStatement {
    sql: String,
    shared: Arc<MockShared>,
}

#[async_trait]
impl DriverStatement for MockStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn execute(&self, _params: &[Value]) -> Result<u64> {
        match self.shared.run(&self.sql).await? {
            Ran::Affected(n) => Ok(n),
            Ran::Rows(_, rows) => Ok(rows.len() as u64),
        }
    }

    async fn query(&self, _params: &[Value]) -> Result<Box<dyn DriverRows>> {
        match self.shared.run(&self.sql).await? {
            Ran::Rows(columns, rows) => Ok(Box::new(MockRows::new(columns, rows))),
            Ran::Affected(_) => Ok(Box::new(MockRows::empty())),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockRows {
    columns: Arc<[String]>,
    rows: VecDeque<Vec<Value>>,
    closed: bool,
}

impl MockRows {
    fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.into(),
            rows: rows.into(),
            closed: false,
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait]
impl DriverRows for MockRows {
    async fn next(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(Error::operation("mock cursor is closed"));
        }
        Ok(self
            .rows
            .pop_front()
            .map(|values| Row::new(Arc::clone(&self.columns), values)))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
