//! Proxy objects wrapping real driver objects.
//!
//! Each proxy wraps exactly one underlying driver object and adds two
//! things: a process-unique monotonic id used as a correlation key in
//! statistics and logs, and a string-keyed attribute bag filters use to
//! stash cross-cutting data. Proxies carry no logic of their own; the
//! filter chain's terminal step delegates to them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use palisade_driver::{DriverConnection, DriverRows, DriverStatement, Error, Result};

static NEXT_PROXY_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next process-unique proxy id.
pub(crate) fn next_proxy_id() -> u64 {
    NEXT_PROXY_ID.fetch_add(1, Ordering::Relaxed)
}

/// A value stored in a proxy attribute bag.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Text.
    Text(String),
}

/// String-keyed attribute bag for cross-filter communication.
///
/// Filters use this to mark work already done on a proxy (for example
/// "this statement was already reported as slow") so filters later in the
/// chain, or later calls on the same proxy, can skip it.
#[derive(Debug, Default)]
pub struct Attributes {
    map: Mutex<HashMap<String, AttrValue>>,
}

impl Attributes {
    /// Store an attribute, replacing any previous value under the key.
    pub fn set(&self, key: impl Into<String>, value: AttrValue) {
        self.map.lock().insert(key.into(), value);
    }

    /// Fetch a copy of an attribute.
    pub fn get(&self, key: &str) -> Option<AttrValue> {
        self.map.lock().get(key).cloned()
    }

    /// Remove an attribute, returning it if present.
    pub fn remove(&self, key: &str) -> Option<AttrValue> {
        self.map.lock().remove(key)
    }

    /// Whether the bag contains the key.
    pub fn contains(&self, key: &str) -> bool {
        self.map.lock().contains_key(key)
    }
}

/// Proxy around one physical connection.
///
/// Created once per physical connection (by the chain's connect terminal)
/// and kept for the connection's whole pooled life; statement proxies
/// reference it. Physical close invalidates it for further use.
pub struct ConnectionProxy {
    id: u64,
    conn: Box<dyn DriverConnection>,
    attrs: Attributes,
    closed: AtomicBool,
    reclaimed: AtomicBool,
    reclaimed_after: Mutex<Option<Duration>>,
}

impl ConnectionProxy {
    /// Wrap a freshly connected driver connection.
    #[must_use]
    pub fn new(conn: Box<dyn DriverConnection>) -> Self {
        Self {
            id: next_proxy_id(),
            conn,
            attrs: Attributes::default(),
            closed: AtomicBool::new(false),
            reclaimed: AtomicBool::new(false),
            reclaimed_after: Mutex::new(None),
        }
    }

    /// Correlation id of this proxy.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The attribute bag shared by all filters seeing this connection.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attrs
    }

    /// Whether the physical connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the connection was forcibly reclaimed from a leaking borrower.
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::Acquire)
    }

    /// Access the underlying driver connection, failing fast if the proxy
    /// has been invalidated.
    pub fn raw(&self) -> Result<&dyn DriverConnection> {
        if self.reclaimed.load(Ordering::Acquire) {
            let held = (*self.reclaimed_after.lock()).unwrap_or_default();
            return Err(Error::LeakWarning {
                connection_id: self.id,
                held,
            });
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::operation(format!(
                "connection proxy {} is closed",
                self.id
            )));
        }
        Ok(self.conn.as_ref())
    }

    /// Mark the proxy as forcibly reclaimed.
    ///
    /// Later calls through [`ConnectionProxy::raw`] fail with
    /// `ErrorKind::LeakWarning`. Called by the pool's abandoned-connection
    /// scan, never by filters.
    pub fn mark_reclaimed(&self, held: Duration) {
        *self.reclaimed_after.lock() = Some(held);
        self.reclaimed.store(true, Ordering::Release);
    }

    /// Close the physical connection. Idempotent.
    pub async fn close_physical(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.conn.close().await
    }
}

impl std::fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProxy")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}

/// Proxy around one logical statement.
///
/// Direct statements carry no driver handle (the terminal executes through
/// the connection); prepared statements carry the shared prepared handle.
pub struct StatementProxy {
    id: u64,
    conn: Arc<ConnectionProxy>,
    prepared: Option<Arc<dyn DriverStatement>>,
    attrs: Attributes,
}

impl StatementProxy {
    /// Create a proxy for a direct (unprepared) statement.
    #[must_use]
    pub fn direct(conn: Arc<ConnectionProxy>) -> Self {
        Self {
            id: next_proxy_id(),
            conn,
            prepared: None,
            attrs: Attributes::default(),
        }
    }

    /// Create a proxy for a prepared statement handle.
    #[must_use]
    pub fn prepared(conn: Arc<ConnectionProxy>, stmt: Arc<dyn DriverStatement>) -> Self {
        Self {
            id: next_proxy_id(),
            conn,
            prepared: Some(stmt),
            attrs: Attributes::default(),
        }
    }

    /// Correlation id of this proxy.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection proxy this statement runs on.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionProxy> {
        &self.conn
    }

    /// The prepared handle, if this is a prepared-statement proxy.
    #[must_use]
    pub fn prepared_handle(&self) -> Option<&Arc<dyn DriverStatement>> {
        self.prepared.as_ref()
    }

    /// SQL text of the prepared handle, if any.
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        self.prepared.as_deref().map(DriverStatement::sql)
    }

    /// The attribute bag of this statement.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attrs
    }
}

impl std::fmt::Debug for StatementProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementProxy")
            .field("id", &self.id)
            .field("connection_id", &self.conn.id())
            .field("prepared", &self.prepared.is_some())
            .finish()
    }
}

/// Proxy around one open result-set cursor.
///
/// Unlike the other proxies this is exclusively owned by the caller that
/// executed the query, so its mutable state needs no lock.
pub struct ResultSetProxy {
    id: u64,
    statement_id: u64,
    rows: Box<dyn DriverRows>,
    attrs: Attributes,
    closed: bool,
    row_count: u64,
}

impl ResultSetProxy {
    /// Wrap a driver cursor produced by the given statement.
    #[must_use]
    pub fn new(statement_id: u64, rows: Box<dyn DriverRows>) -> Self {
        Self {
            id: next_proxy_id(),
            statement_id,
            rows,
            attrs: Attributes::default(),
            closed: false,
            row_count: 0,
        }
    }

    /// Correlation id of this proxy.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the statement proxy that produced this result set.
    #[must_use]
    pub fn statement_id(&self) -> u64 {
        self.statement_id
    }

    /// The attribute bag of this result set.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attrs
    }

    /// Rows fetched through this proxy so far.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Whether the cursor has been logically closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Access the underlying cursor, failing fast after close.
    pub(crate) fn raw(&mut self) -> Result<&mut dyn DriverRows> {
        if self.closed {
            return Err(Error::operation(format!(
                "result set proxy {} is closed",
                self.id
            )));
        }
        Ok(self.rows.as_mut())
    }

    pub(crate) fn record_row(&mut self) {
        self.row_count += 1;
    }

    pub(crate) async fn close_cursor(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.rows.close().await
    }
}

impl std::fmt::Debug for ResultSetProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSetProxy")
            .field("id", &self.id)
            .field("statement_id", &self.statement_id)
            .field("row_count", &self.row_count)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_ids_are_monotonic() {
        let a = next_proxy_id();
        let b = next_proxy_id();
        assert!(b > a);
    }

    #[test]
    fn test_attribute_bag_round_trip() {
        let attrs = Attributes::default();
        assert!(!attrs.contains("logged"));

        attrs.set("logged", AttrValue::Bool(true));
        assert_eq!(attrs.get("logged"), Some(AttrValue::Bool(true)));

        attrs.set("logged", AttrValue::Int(2));
        assert_eq!(attrs.remove("logged"), Some(AttrValue::Int(2)));
        assert!(attrs.get("logged").is_none());
    }
}
