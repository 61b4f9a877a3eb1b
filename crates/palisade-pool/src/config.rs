//! Pool configuration.

use std::time::Duration;

use palisade_driver::{Error, Result};

/// Configuration for the connection pool.
///
/// Immutable once the pool starts; the builder methods are for assembly
/// before [`validate`](PoolConfig::validate) runs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections the pool keeps warm.
    pub min_idle: u32,

    /// Hard cap on simultaneously live connections (idle + borrowed).
    pub max_active: u32,

    /// Default time an acquire waits before failing with pool exhaustion.
    pub max_wait: Duration,

    /// Statement used by the validation probe; `None` lets the driver use
    /// a protocol-level ping.
    pub validation_query: Option<String>,

    /// Probe a connection before handing it to a borrower.
    pub test_on_borrow: bool,

    /// Probe a connection when it returns to the pool.
    pub test_on_return: bool,

    /// Probe idle connections during eviction runs.
    pub test_while_idle: bool,

    /// Interval between eviction runs; zero disables the scheduler.
    pub time_between_eviction_runs: Duration,

    /// Idle age beyond which a connection is eligible for eviction.
    pub min_evictable_idle_time: Duration,

    /// Force-reclaim connections held longer than the abandoned timeout.
    pub remove_abandoned: bool,

    /// How long a borrow may last before it counts as abandoned.
    pub remove_abandoned_timeout: Duration,

    /// Cache prepared statements per connection.
    pub pool_prepared_statements: bool,

    /// Bound of the per-connection prepared-statement cache.
    pub max_pool_prepared_statements_per_connection: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_active: 10,
            max_wait: Duration::from_secs(30),
            validation_query: None,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: true,
            time_between_eviction_runs: Duration::from_secs(60),
            min_evictable_idle_time: Duration::from_secs(1800),
            remove_abandoned: false,
            remove_abandoned_timeout: Duration::from_secs(300),
            pool_prepared_statements: false,
            max_pool_prepared_statements_per_connection: 10,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum idle connection count.
    #[must_use]
    pub fn min_idle(mut self, count: u32) -> Self {
        self.min_idle = count;
        self
    }

    /// Set the maximum live connection count.
    #[must_use]
    pub fn max_active(mut self, count: u32) -> Self {
        self.max_active = count;
        self
    }

    /// Set the default acquire wait budget.
    #[must_use]
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Set the validation query.
    #[must_use]
    pub fn validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = Some(query.into());
        self
    }

    /// Enable or disable the probe before handing out a connection.
    #[must_use]
    pub fn test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }

    /// Enable or disable the probe on connection return.
    #[must_use]
    pub fn test_on_return(mut self, enabled: bool) -> Self {
        self.test_on_return = enabled;
        self
    }

    /// Enable or disable probing idle connections during eviction.
    #[must_use]
    pub fn test_while_idle(mut self, enabled: bool) -> Self {
        self.test_while_idle = enabled;
        self
    }

    /// Set the eviction run interval; zero disables the scheduler.
    #[must_use]
    pub fn time_between_eviction_runs(mut self, interval: Duration) -> Self {
        self.time_between_eviction_runs = interval;
        self
    }

    /// Set the idle age that makes a connection evictable.
    #[must_use]
    pub fn min_evictable_idle_time(mut self, age: Duration) -> Self {
        self.min_evictable_idle_time = age;
        self
    }

    /// Enable abandoned-connection reclamation with the given timeout.
    #[must_use]
    pub fn remove_abandoned(mut self, timeout: Duration) -> Self {
        self.remove_abandoned = true;
        self.remove_abandoned_timeout = timeout;
        self
    }

    /// Enable the per-connection prepared-statement cache.
    #[must_use]
    pub fn pool_prepared_statements(mut self, max_per_connection: usize) -> Self {
        self.pool_prepared_statements = true;
        self.max_pool_prepared_statements_per_connection = max_per_connection;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(Error::config("max_active must be greater than 0"));
        }
        if self.min_idle > self.max_active {
            return Err(Error::config(format!(
                "min_idle ({}) cannot be greater than max_active ({})",
                self.min_idle, self.max_active
            )));
        }
        if self.pool_prepared_statements && self.max_pool_prepared_statements_per_connection == 0 {
            return Err(Error::config(
                "max_pool_prepared_statements_per_connection must be greater than 0 \
                 when statement pooling is enabled",
            ));
        }
        if self.remove_abandoned && self.remove_abandoned_timeout.is_zero() {
            return Err(Error::config(
                "remove_abandoned_timeout must be non-zero when remove_abandoned is enabled",
            ));
        }
        Ok(())
    }
}
