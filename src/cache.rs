//! Shared cache interface backing the idempotency guard.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Key-value cache with expiry, e.g. Redis.
///
/// Implementations report an unreachable cache as
/// [`EngineError::CacheUnavailable`](crate::EngineError::CacheUnavailable).
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Stores `value` only if `key` is absent; returns whether it was stored.
    ///
    /// This must be atomic (`SET key value NX EX ttl`).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Stores `value` only if `key` currently holds `expected`; returns
    /// whether it was stored. An absent or expired key never matches.
    ///
    /// This must be atomic, e.g. a Lua compare-and-set script on Redis.
    async fn replace_if(&self, key: &str, expected: &str, value: &str, ttl: Duration) -> Result<bool>;
}
