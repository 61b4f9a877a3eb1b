//! SQL wall (firewall) filter.
//!
//! [`WallFilter`] vetoes statements before the terminal driver operation
//! runs, which is the one sanctioned way to skip the real call. The rule engine
//! here is deliberately small: statement stacking and comment heuristics,
//! an optional DDL block, and operator-supplied deny patterns. Richer rule
//! sets plug in through the same deny-pattern surface.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use palisade_driver::{Error, Result, Value};

use crate::chain::FilterChain;
use crate::filter::Filter;
use crate::proxy::{ResultSetProxy, StatementProxy};

#[allow(clippy::unwrap_used)]
static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"--|/\*|\*/").unwrap());

const DDL_VERBS: &[&str] = &["DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE"];

/// Wall rule configuration.
#[derive(Debug, Clone)]
pub struct WallConfig {
    /// Regex patterns; a statement matching any of them is rejected.
    pub deny_patterns: Vec<String>,
    /// Reject statements containing a second stacked statement.
    pub block_multi_statement: bool,
    /// Reject statements containing SQL comments.
    pub block_comment: bool,
    /// Reject DDL statements (DROP/TRUNCATE/ALTER/CREATE/GRANT/REVOKE).
    pub block_ddl: bool,
}

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            deny_patterns: Vec::new(),
            block_multi_statement: true,
            block_comment: true,
            block_ddl: false,
        }
    }
}

impl WallConfig {
    /// Add a deny pattern.
    #[must_use]
    pub fn deny(mut self, pattern: impl Into<String>) -> Self {
        self.deny_patterns.push(pattern.into());
        self
    }

    /// Enable or disable the DDL block.
    #[must_use]
    pub fn block_ddl(mut self, enabled: bool) -> Self {
        self.block_ddl = enabled;
        self
    }
}

/// The firewall filter.
pub struct WallFilter {
    config: WallConfig,
    rules: Vec<Regex>,
    violations: AtomicU64,
}

impl WallFilter {
    /// Build a wall filter, compiling the configured deny patterns.
    pub fn new(config: WallConfig) -> Result<Self> {
        let rules = config
            .deny_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| Error::config(format!("invalid wall deny pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            rules,
            violations: AtomicU64::new(0),
        })
    }

    /// Statements rejected so far.
    #[must_use]
    pub fn violation_count(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    fn check(&self, sql: &str) -> Result<()> {
        if let Some(reason) = self.violation_reason(sql) {
            self.violations.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(sql = sql, reason = reason, "wall rejected statement");
            return Err(Error::operation_with_sql(
                format!("wall rejected statement: {reason}"),
                sql,
            ));
        }
        Ok(())
    }

    fn violation_reason(&self, sql: &str) -> Option<&'static str> {
        if self.config.block_multi_statement && has_stacked_statement(sql) {
            return Some("statement stacking");
        }
        if self.config.block_comment && COMMENT_RE.is_match(sql) {
            return Some("comment in statement");
        }
        if self.config.block_ddl && is_ddl(sql) {
            return Some("ddl blocked");
        }
        if self.rules.iter().any(|r| r.is_match(sql)) {
            return Some("deny pattern matched");
        }
        None
    }
}

/// A semicolon followed by anything but trailing whitespace means a second
/// statement is stacked behind the first. Semicolons inside string
/// literals do not count.
fn has_stacked_statement(sql: &str) -> bool {
    let mut in_string = false;
    let mut quote = ' ';
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if in_string {
            if c == quote {
                if chars.peek().map(|(_, n)| *n) == Some(quote) {
                    chars.next();
                    continue;
                }
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                in_string = true;
                quote = c;
            }
            ';' => {
                if !sql[i + 1..].trim().is_empty() {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn is_ddl(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    DDL_VERBS.iter().any(|verb| {
        trimmed.len() >= verb.len()
            && trimmed[..verb.len()].eq_ignore_ascii_case(verb)
            && trimmed[verb.len()..]
                .chars()
                .next()
                .is_none_or(char::is_whitespace)
    })
}

#[async_trait]
impl Filter for WallFilter {
    fn name(&self) -> &str {
        "wall"
    }

    async fn statement_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        self.check(sql)?;
        chain.statement_execute(stmt, sql, params).await
    }

    async fn statement_execute_update(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        self.check(sql)?;
        chain.statement_execute_update(stmt, sql, params).await
    }

    async fn statement_execute_query(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        sql: &str,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        self.check(sql)?;
        chain.statement_execute_query(stmt, sql, params).await
    }

    async fn statement_execute_batch(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        batch: &[String],
    ) -> Result<Vec<u64>> {
        for sql in batch {
            self.check(sql)?;
        }
        chain.statement_execute_batch(stmt, batch).await
    }

    async fn prepared_execute(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        if let Some(sql) = stmt.sql() {
            self.check(sql)?;
        }
        chain.prepared_execute(stmt, params).await
    }

    async fn prepared_execute_update(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<u64> {
        if let Some(sql) = stmt.sql() {
            self.check(sql)?;
        }
        chain.prepared_execute_update(stmt, params).await
    }

    async fn prepared_execute_query(
        &self,
        chain: FilterChain<'_>,
        stmt: &StatementProxy,
        params: &[Value],
    ) -> Result<ResultSetProxy> {
        if let Some(sql) = stmt.sql() {
            self.check(sql)?;
        }
        chain.prepared_execute_query(stmt, params).await
    }
}

impl std::fmt::Debug for WallFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WallFilter")
            .field("deny_patterns", &self.config.deny_patterns.len())
            .field("violations", &self.violation_count())
            .finish()
    }
}
