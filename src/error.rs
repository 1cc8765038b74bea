//! Typed failure conditions raised by the cache layer.
//!
//! Service operations return `anyhow::Result`; these variants are the
//! conditions callers may want to match on via `downcast_ref`.

use thiserror::Error;

/// Errors originating in the cache layer itself (never from a caller's fetch).
#[derive(Debug, Error)]
pub enum CacheError {
    /// A stampede-protected lookup gave up waiting for the lock holder.
    #[error("timed out waiting for cache lock on '{key}' after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    /// A wildcard template could not be compiled into a [`KeyPattern`](crate::KeyPattern).
    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    /// Key parameters or a cached value could not be serialized.
    #[error("cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration rejected by [`CacheConfig::validate`](crate::CacheConfig::validate).
    #[error("invalid cache configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_message() {
        let err = CacheError::LockTimeout {
            key: "place:detail:1".to_string(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for cache lock on 'place:detail:1' after 3 attempts"
        );
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = CacheError::Config("bad".to_string()).into();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::Config(_))
        ));
    }
}
