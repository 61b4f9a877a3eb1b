//! Statement fingerprinting.
//!
//! Statistics are keyed by a normalized form of the statement text so that
//! `SELECT * FROM t WHERE id = 1` and `SELECT * FROM t WHERE id = 2` land
//! in the same bucket. The default keyer replaces string and numeric
//! literals with a placeholder; an external normalizer (for example a real
//! SQL parser) can be plugged in through [`StatementKeyer`]. Keying by raw
//! text is the degraded fallback, not a failure.

/// Produces a stable key from raw statement text.
pub trait StatementKeyer: Send + Sync {
    /// Compute the fingerprint for one statement.
    fn fingerprint(&self, sql: &str) -> String;
}

/// Identity keyer: raw statement text, truncated.
///
/// Used when no normalizer is available; bucketing is less effective but
/// everything still works.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawKeyer;

impl StatementKeyer for RawKeyer {
    fn fingerprint(&self, sql: &str) -> String {
        truncate(sql.trim(), LiteralNormalizer::DEFAULT_MAX_LENGTH)
    }
}

/// Default keyer: replaces literal values with a placeholder and collapses
/// whitespace.
#[derive(Debug, Clone)]
pub struct LiteralNormalizer {
    /// Placeholder substituted for literals.
    pub placeholder: char,
    /// Maximum fingerprint length.
    pub max_length: usize,
}

impl LiteralNormalizer {
    const DEFAULT_MAX_LENGTH: usize = 1024;

    /// Create a normalizer with the given placeholder.
    #[must_use]
    pub fn new(placeholder: char) -> Self {
        Self {
            placeholder,
            max_length: Self::DEFAULT_MAX_LENGTH,
        }
    }
}

impl Default for LiteralNormalizer {
    fn default() -> Self {
        Self::new('?')
    }
}

impl StatementKeyer for LiteralNormalizer {
    fn fingerprint(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut chars = sql.trim().chars().peekable();
        let mut pending_space = false;

        while let Some(c) = chars.next() {
            // Quoted string literal: consume to the closing quote,
            // honoring doubled-quote escapes.
            if c == '\'' || c == '"' {
                let quote = c;
                loop {
                    match chars.next() {
                        Some(q) if q == quote => {
                            if chars.peek() == Some(&quote) {
                                chars.next();
                                continue;
                            }
                            break;
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
                flush_space(&mut out, &mut pending_space);
                out.push(self.placeholder);
                continue;
            }

            // Numeric literal, unless glued to an identifier (t1, col_2).
            // A pending space means the digit starts a new token even
            // though the space has not been flushed yet.
            if c.is_ascii_digit()
                && (pending_space
                    || !out.ends_with(|ch: char| ch.is_alphanumeric() || ch == '_'))
            {
                while chars
                    .peek()
                    .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
                {
                    chars.next();
                }
                flush_space(&mut out, &mut pending_space);
                out.push(self.placeholder);
                continue;
            }

            if c.is_whitespace() {
                pending_space = !out.is_empty();
                continue;
            }

            flush_space(&mut out, &mut pending_space);
            out.push(c);
        }

        truncate(&out, self.max_length)
    }
}

fn flush_space(out: &mut String, pending: &mut bool) {
    if *pending {
        out.push(' ');
        *pending = false;
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
