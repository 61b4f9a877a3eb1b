//! # palisade-pool
//!
//! Async database connection pool with an embedded interception pipeline.
//!
//! The pool hands out validated connections to many concurrent callers,
//! reclaims them safely, keeps a configurable number of idle connections
//! warm, and evicts broken or stale ones. Every call made through a
//! borrowed connection travels through the ordered filter chain from
//! `palisade-filter`, so monitoring, statistics and firewall enforcement
//! happen without the caller or the driver knowing.
//!
//! ## Guarantees
//!
//! - **FIFO fairness**: a release always satisfies the longest-waiting
//!   borrower first; a timed-out waiter strictly fails with
//!   `ErrorKind::PoolExhausted` even if a release races the timeout.
//! - **Single borrower**: a connection holder is never lent to two
//!   callers at once; double release is a logged no-op.
//! - **Deterministic interception**: the filter order is fixed at build
//!   time and identical for every logical call.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use palisade_driver::ConnectSpec;
//! use palisade_pool::{Pool, PoolConfig};
//!
//! let pool = Pool::builder()
//!     .name("orders-db")
//!     .driver(driver)
//!     .connect_spec(ConnectSpec::new("postgres://localhost/orders"))
//!     .config(
//!         PoolConfig::new()
//!             .min_idle(2)
//!             .max_active(10)
//!             .validation_query("SELECT 1"),
//!     )
//!     .build()
//!     .await?;
//!
//! let conn = pool.acquire().await?;
//! let rows = conn.execute_query("SELECT id FROM orders", &[]).await?;
//! conn.close().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod conn;
mod eviction;
pub mod holder;
pub mod pool;
pub mod registry;

pub use config::PoolConfig;
pub use conn::{PooledConnection, PooledRows, PooledStatement};
pub use holder::ConnectionHolder;
pub use pool::{Pool, PoolBuilder, PoolStats, PoolStatus};
pub use registry::{PoolRegistry, PoolReport};
