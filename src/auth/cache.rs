//! Token cache abstraction.
//!
//! The cache is a performance optimisation only: every read failure is
//! treated as a miss and every write failure is swallowed by the caller.

use std::collections::HashMap;

use anyhow::Result;

/// Build the cache key for a raw bearer token value.
pub fn token_cache_key(raw_token: &str) -> String {
    format!("token:{raw_token}")
}

/// Keyed hash-field store with per-key expiry.
///
/// Implementations borrow a pooled connection per call and give it back on
/// every exit path, including when the calling future is dropped.
#[async_trait::async_trait]
pub trait TokenCache: Send + Sync {
    /// HGETALL.  `Ok(None)` on a miss (including an expired key).
    async fn read_all_fields(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// HSET of every pair.
    async fn write_all_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// EXPIRE in seconds.
    async fn set_expiry(&self, key: &str, ttl_secs: u64) -> Result<()>;

    /// Connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<()>;
}
