//! Driver SPI traits.
//!
//! A physical database driver plugs into the pool by implementing these
//! traits. The pool never speaks a wire protocol itself; it manages
//! lifecycles and routes every call through the filter chain, terminating
//! in one of the methods below.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::value::{Row, Value};

/// What a driver needs to open one physical connection.
#[derive(Debug, Clone)]
pub struct ConnectSpec {
    /// Driver-interpreted connection URL.
    pub url: String,
    /// Additional driver properties.
    pub properties: HashMap<String, String>,
    /// Budget for establishing the physical connection.
    pub connect_timeout: Duration,
}

impl ConnectSpec {
    /// Create a spec for the given URL with default timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            properties: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Add a driver property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Factory for physical connections.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a new physical connection.
    ///
    /// Connectivity failures are reported as
    /// [`ErrorKind::Connectivity`](crate::ErrorKind::Connectivity) and are
    /// never retried here; retry policy belongs to the pool.
    async fn connect(&self, spec: &ConnectSpec) -> Result<Box<dyn DriverConnection>>;

    /// Short driver name used in logs.
    fn name(&self) -> &str;
}

/// One physical database connection.
///
/// Methods take `&self`; implementations guard their own I/O state. The
/// pool guarantees a connection is never borrowed by two callers at once,
/// so contention on that internal state is not a hot path.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Execute a statement that modifies data; returns the affected count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a statement that returns rows.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Box<dyn DriverRows>>;

    /// Prepare a statement for repeated execution.
    async fn prepare(&self, sql: &str) -> Result<Arc<dyn DriverStatement>>;

    /// Liveness probe.
    ///
    /// With a validation query configured the driver executes it; without
    /// one it may fall back to a protocol-level ping.
    async fn ping(&self, validation_query: Option<&str>) -> Result<()>;

    /// Roll back any open transaction state.
    async fn rollback(&self) -> Result<()>;

    /// Clear accumulated warnings before the connection re-enters the pool.
    async fn clear_warnings(&self) -> Result<()>;

    /// Close the physical connection.
    async fn close(&self) -> Result<()>;
}

/// A prepared statement handle.
///
/// Handles are shared (`Arc`) so the holder's statement cache can hand the
/// same preparation to successive borrowers of a connection.
#[async_trait]
pub trait DriverStatement: Send + Sync {
    /// The SQL text this statement was prepared from.
    fn sql(&self) -> &str;

    /// Execute with the given parameters; returns the affected count.
    async fn execute(&self, params: &[Value]) -> Result<u64>;

    /// Execute and return rows.
    async fn query(&self, params: &[Value]) -> Result<Box<dyn DriverRows>>;

    /// Release server-side resources for this preparation.
    async fn close(&self) -> Result<()>;
}

/// Cursor over a result set.
#[async_trait]
pub trait DriverRows: Send {
    /// Fetch the next row, or `None` when the set is drained.
    async fn next(&mut self) -> Result<Option<Row>>;

    /// Release the cursor.
    async fn close(&mut self) -> Result<()>;
}
