//! Feed backend abstraction for the WebSub subscriber callback.
//!
//! The callback handler only knows feeds by id.  Secrets, leases and the
//! delivered content itself belong to a [`FeedBackend`]; parsing the content
//! (RSS, Atom, microformats) happens behind it.

pub mod keydb;

use anyhow::Result;
use bytes::Bytes;

/// Storage side of the WebSub callback.
#[async_trait::async_trait]
pub trait FeedBackend: Send + Sync {
    /// Shared secret for `feed_id`.  `Ok(None)` (or an empty secret) means
    /// the feed is unknown.
    async fn secret(&self, feed_id: i64) -> Result<Option<String>>;

    /// Record the lease granted by the hub during verification.
    async fn set_lease_seconds(&self, feed_id: i64, lease_seconds: i64) -> Result<()>;

    /// Hand over a verified delivery, body untouched.
    async fn update_feed(&self, feed_id: i64, content_type: &str, body: Bytes) -> Result<()>;
}

/// Optional capability: a backend that can describe a feed's state.
#[async_trait::async_trait]
pub trait FeedDiagnostics: Send + Sync {
    async fn feed_summary(&self, feed_id: i64) -> Result<String>;
}
