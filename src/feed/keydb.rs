//! KeyDB-backed [`FeedBackend`].
//!
//! Layout:
//! - `feed:<id>` hash: `secret`, `lease_seconds`, `lease_updated_at`
//! - `feed:<id>:incoming` list: newest-first JSON envelopes of accepted
//!   deliveries, trimmed to `max_queued`, consumed by the feed parser.

use std::time::Duration;

use anyhow::{bail, ensure, Result};
use base64::Engine;
use bytes::Bytes;
use fred::clients::Pool;
use fred::interfaces::{HashesInterface, KeysInterface, ListInterface};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FeedBackend, FeedDiagnostics};
use crate::keydb::bounded;

/// Content types the downstream parser understands.
const SUPPORTED_CONTENT_TYPES: &[&str] = &[
    "application/rss+xml",
    "application/atom+xml",
    "application/xml",
    "text/xml",
    "text/html",
];

pub(crate) fn feed_key(feed_id: i64) -> String {
    format!("feed:{feed_id}")
}

pub(crate) fn incoming_key(feed_id: i64) -> String {
    format!("feed:{feed_id}:incoming")
}

/// Whether `content_type` (parameters allowed) is one the parser handles.
pub fn is_supported_content_type(content_type: &str) -> bool {
    let content_type = content_type.trim_start().to_ascii_lowercase();
    SUPPORTED_CONTENT_TYPES
        .iter()
        .any(|supported| content_type.starts_with(supported))
}

/// Reject deliveries the parser cannot read, before touching KeyDB.
pub fn check_content_type(content_type: &str) -> Result<()> {
    if !is_supported_content_type(content_type) {
        bail!("unknown format of body: {content_type}");
    }
    Ok(())
}

/// A hub-granted lease must be a positive number of seconds.
pub fn check_lease_seconds(lease_seconds: i64) -> Result<()> {
    ensure!(lease_seconds > 0, "lease_seconds must be positive, got {lease_seconds}");
    Ok(())
}

/// Missing and empty secrets both mean the feed is unknown.
fn non_empty_secret(secret: Option<String>) -> Option<String> {
    secret.filter(|s| !s.is_empty())
}

/// LTRIM stop index once the queue holds `queued` entries, or `None` while
/// it is within `max_queued`.
fn trim_stop(queued: i64, max_queued: i64) -> Option<i64> {
    (queued > max_queued).then(|| max_queued - 1)
}

/// Queued form of an accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub content_type: String,
    /// RFC 3339 receive time.
    pub received_at: String,
    /// Base64 of the raw body.
    pub body: String,
}

impl Delivery {
    pub fn new(content_type: &str, body: &[u8]) -> Self {
        Self {
            content_type: content_type.to_string(),
            received_at: chrono::Utc::now().to_rfc3339(),
            body: base64::engine::general_purpose::STANDARD.encode(body),
        }
    }
}

#[derive(Clone)]
pub struct KeyDbFeedBackend {
    pool: Pool,
    timeout: Duration,
    max_queued: i64,
}

impl KeyDbFeedBackend {
    pub fn new(pool: Pool, timeout: Duration, max_queued: i64) -> Self {
        Self {
            pool,
            timeout,
            max_queued,
        }
    }
}

#[async_trait::async_trait]
impl FeedBackend for KeyDbFeedBackend {
    async fn secret(&self, feed_id: i64) -> Result<Option<String>> {
        let secret: Option<String> = bounded(
            self.timeout,
            "HGET",
            self.pool.hget(feed_key(feed_id), "secret"),
        )
        .await?;
        Ok(non_empty_secret(secret))
    }

    async fn set_lease_seconds(&self, feed_id: i64, lease_seconds: i64) -> Result<()> {
        check_lease_seconds(lease_seconds)?;

        let key = feed_key(feed_id);
        let exists: i64 = bounded(self.timeout, "EXISTS", self.pool.exists(&key)).await?;
        if exists == 0 {
            bail!("unknown feed {feed_id}");
        }

        let fields = vec![
            ("lease_seconds".to_string(), lease_seconds.to_string()),
            ("lease_updated_at".to_string(), chrono::Utc::now().to_rfc3339()),
        ];
        let _: () = bounded(self.timeout, "HSET", self.pool.hset(&key, fields)).await?;
        debug!(feed_id, lease_seconds, "lease updated");
        Ok(())
    }

    async fn update_feed(&self, feed_id: i64, content_type: &str, body: Bytes) -> Result<()> {
        check_content_type(content_type)?;

        let envelope = serde_json::to_string(&Delivery::new(content_type, &body))?;
        let key = incoming_key(feed_id);
        let queued: i64 = bounded(self.timeout, "LPUSH", self.pool.lpush(&key, envelope)).await?;
        if let Some(stop) = trim_stop(queued, self.max_queued) {
            let _: () = bounded(self.timeout, "LTRIM", self.pool.ltrim(&key, 0, stop)).await?;
        }
        debug!(feed_id, content_type, bytes = body.len(), "delivery queued");
        Ok(())
    }
}

#[async_trait::async_trait]
impl FeedDiagnostics for KeyDbFeedBackend {
    async fn feed_summary(&self, feed_id: i64) -> Result<String> {
        let lease: Option<String> = bounded(
            self.timeout,
            "HGET",
            self.pool.hget(feed_key(feed_id), "lease_seconds"),
        )
        .await?;
        let queued: i64 = bounded(self.timeout, "LLEN", self.pool.llen(incoming_key(feed_id))).await?;
        Ok(format!(
            "feed {feed_id}: lease_seconds={} queued={queued}",
            lease.as_deref().unwrap_or("unset")
        ))
    }
}
