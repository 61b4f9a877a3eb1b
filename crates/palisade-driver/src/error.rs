//! The shared error taxonomy.
//!
//! Every layer of the pool (driver calls, filter chain, pool manager)
//! reports failures through the single [`Error`] type. Filters that need
//! differentiated behavior match on [`Error::kind`] instead of downcasting.

use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the palisade crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification checked by filters and retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Physical connect or validation failure.
    Connectivity,
    /// Acquisition wait timed out; the caller may retry.
    PoolExhausted,
    /// The pool was shut down; terminal, no retry.
    PoolClosed,
    /// The wrapped real operation failed (or a filter vetoed it).
    Operation,
    /// A borrowed connection was held past the abandoned timeout and
    /// forcibly reclaimed.
    LeakWarning,
    /// Invalid configuration detected before the pool started.
    Configuration,
}

impl ErrorKind {
    /// Whether a fresh attempt can reasonably succeed.
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connectivity | Self::PoolExhausted)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connectivity => "connectivity",
            Self::PoolExhausted => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::Operation => "operation",
            Self::LeakWarning => "leak_warning",
            Self::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Error type shared by the driver SPI, the filter chain and the pool.
#[derive(Debug, Error)]
pub enum Error {
    /// Physical connect or validation probe failure.
    #[error("connectivity error: {message}")]
    Connectivity {
        /// What failed.
        message: String,
        /// Underlying driver cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No connection became available within the wait budget.
    #[error("pool exhausted: no connection after {}ms", waited.as_millis())]
    PoolExhausted {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The pool has been shut down.
    #[error("pool is closed")]
    PoolClosed,

    /// The real operation failed, or a filter rejected it.
    #[error("operation error: {message}")]
    Operation {
        /// What failed.
        message: String,
        /// Statement text, when the failure is tied to one.
        sql: Option<String>,
        /// Underlying driver cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The connection was forcibly reclaimed after being held too long.
    #[error("connection {connection_id} reclaimed after being held for {}ms", held.as_millis())]
    LeakWarning {
        /// Id of the reclaimed connection proxy.
        connection_id: u64,
        /// How long the borrower had held it.
        held: Duration,
    },

    /// Configuration rejected before pool start.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Get the kind discriminator for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::Operation { .. } => ErrorKind::Operation,
            Self::LeakWarning { .. } => ErrorKind::LeakWarning,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether a fresh attempt can reasonably succeed.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Create a connectivity error.
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connectivity error wrapping a driver cause.
    pub fn connectivity_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connectivity {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an operation error.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create an operation error carrying the offending statement text.
    pub fn operation_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::connectivity("down").kind(), ErrorKind::Connectivity);
        assert_eq!(
            Error::PoolExhausted {
                waited: Duration::from_millis(100)
            }
            .kind(),
            ErrorKind::PoolExhausted
        );
        assert_eq!(Error::PoolClosed.kind(), ErrorKind::PoolClosed);
        assert_eq!(Error::operation("boom").kind(), ErrorKind::Operation);
        assert_eq!(Error::config("bad").kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_retriable() {
        assert!(Error::connectivity("down").is_retriable());
        assert!(
            Error::PoolExhausted {
                waited: Duration::from_secs(1)
            }
            .is_retriable()
        );
        assert!(!Error::PoolClosed.is_retriable());
        assert!(!Error::operation("boom").is_retriable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::PoolExhausted {
            waited: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("250ms"));

        let err = Error::operation_with_sql("rejected", "DROP TABLE x");
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn test_source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::connectivity_with_source("connect failed", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
