use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Key/value store with per-entry TTL, used for fingerprinted responses.
///
/// Implementations must be safe for concurrent use. Errors are reported
/// as-is; callers decide whether an outage is fatal.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Human-readable backend name for logging.
    fn backend(&self) -> &'static str;
}
