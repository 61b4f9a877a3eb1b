//! # palisade-filter
//!
//! Proxy layer and interception pipeline for the palisade connection pool.
//!
//! Every call made through a pooled connection (statement execution,
//! result fetch, physical connect and close, pool borrow and return) is
//! routed through an ordered chain of [`Filter`]s. Each filter may observe
//! the call, enrich it, or veto it; the chain's terminal step performs the
//! real driver operation exactly once. Neither the caller nor the driver
//! knows the chain exists.
//!
//! Built-in filters:
//!
//! - [`StatFilter`]: per-fingerprint execution statistics and pool-wide
//!   gauges, fed into a shared [`StatCollector`].
//! - [`WallFilter`]: SQL firewall; rejects statements before they reach
//!   the driver.
//! - [`SlowLogFilter`]: logs statements slower than a threshold.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use palisade_filter::{FilterPipeline, StatCollector, StatFilter, WallConfig, WallFilter};
//!
//! let collector = Arc::new(StatCollector::new());
//! let pipeline = FilterPipeline::new(
//!     vec![
//!         Arc::new(WallFilter::new(WallConfig::default())?),
//!         Arc::new(StatFilter::new(Arc::clone(&collector))),
//!     ],
//!     driver,
//! );
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod chain;
pub mod filter;
pub mod fingerprint;
pub mod proxy;
pub mod slowlog;
pub mod stat;
pub mod wall;

pub use chain::{FilterChain, FilterPipeline};
pub use filter::{Filter, PoolFacade};
pub use fingerprint::{LiteralNormalizer, RawKeyer, StatementKeyer};
pub use proxy::{AttrValue, Attributes, ConnectionProxy, ResultSetProxy, StatementProxy};
pub use slowlog::SlowLogFilter;
pub use stat::{StatCollector, StatFilter, StatSnapshot, StatementSnapshot, StatementStats};
pub use wall::{WallConfig, WallFilter};
