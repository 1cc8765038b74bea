//! Key patterns used for pattern invalidation.
//!
//! A pattern is a key template with at most one `*` wildcard, placed either at
//! the end (`place:list:*`) or at the start (`*:stats`). Patterns are compiled
//! once into a [`KeyPattern`] and matched with plain string comparisons; the
//! Redis backend renders them back into an escaped glob for `SCAN MATCH`.

use std::fmt;
use std::str::FromStr;

use crate::error::CacheError;

/// A compiled key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Matches exactly one key.
    Exact(String),
    /// Matches every key starting with the literal (`literal*`).
    Prefix(String),
    /// Matches every key ending with the literal (`*literal`).
    Suffix(String),
}

impl KeyPattern {
    /// Compile a wildcard template.
    ///
    /// A literal `*` or `\` inside a key is written `\*` or `\\`, the
    /// form [`Display`](fmt::Display) produces.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidPattern`] if the template is empty, holds
    /// more than one `*`, places the wildcard in the middle of the key, or
    /// ends in a dangling escape.
    pub fn parse(template: &str) -> Result<Self, CacheError> {
        let invalid = |reason| CacheError::InvalidPattern {
            pattern: template.to_string(),
            reason,
        };

        if template.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let mut literal = String::with_capacity(template.len());
        let mut wildcards = Vec::new();
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => literal.push(escaped),
                    None => return Err(invalid("pattern ends in a dangling escape")),
                },
                '*' => wildcards.push(literal.len()),
                other => literal.push(other),
            }
        }

        match wildcards.as_slice() {
            [] => Ok(Self::Exact(literal)),
            [at] if *at == literal.len() => Ok(Self::Prefix(literal)),
            [0] => Ok(Self::Suffix(literal)),
            [_] => Err(invalid("wildcard must be the first or last character")),
            _ => Err(invalid("only a single wildcard segment is supported")),
        }
    }

    /// Pattern matching exactly `key`.
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    /// Pattern matching every key that starts with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Check whether `key` is matched by this pattern.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => key == exact,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => key.ends_with(suffix.as_str()),
        }
    }

    /// `true` for [`KeyPattern::Exact`], which never needs a key scan.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }

    /// Render as a Redis glob with glob metacharacters in the literal escaped.
    #[must_use]
    pub fn to_glob(&self) -> String {
        match self {
            Self::Exact(exact) => escape_glob(exact),
            Self::Prefix(prefix) => format!("{}*", escape_glob(prefix)),
            Self::Suffix(suffix) => format!("*{}", escape_glob(suffix)),
        }
    }
}

fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn escape_template(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Renders the template accepted by [`KeyPattern::parse`].
impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(&escape_template(exact)),
            Self::Prefix(prefix) => write!(f, "{}*", escape_template(prefix)),
            Self::Suffix(suffix) => write!(f, "*{}", escape_template(suffix)),
        }
    }
}

impl FromStr for KeyPattern {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
