//! KeyDB / Redis client pool creation and the pooled token cache.
//!
//! Builds a [`fred::clients::Pool`] configured for the KeyDB instance
//! described in [`crate::config::KeyDbConfig`], optionally enabling TLS
//! via `rustls` and reading the auth token from an environment variable.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::{ClientLike, HashesInterface, KeysInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;
use tracing::trace;

use crate::auth::cache::TokenCache;

/// Create a KeyDB connection pool from the application configuration.
///
/// The pool is initialised (connected + PING verified) before being returned.
pub async fn create_keydb_pool(config: &crate::config::KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    // The endpoint may carry a `rediss://` or `redis://` scheme prefix.
    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");

    let (host, port) = parse_host_port(endpoint)?;

    let server_config = ServerConfig::new_centralized(host, port);

    let mut fred_config = fred::types::config::Config {
        server: server_config,
        ..fred::types::config::Config::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(ref token) = auth_token {
        fred_config.password = Some(token.clone());
    }

    let mut builder = Builder::from_config(fred_config);

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build KeyDB connection pool")?;

    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host = host,
        port = port,
        tls = config.tls,
        pool_size = config.pool_size,
        "KeyDB pool created and verified"
    );

    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a database index).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

/// Bound a single KeyDB round-trip.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T, fred::error::Error>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .with_context(|| format!("KeyDB {what} timed out after {timeout:?}"))?
        .with_context(|| format!("KeyDB {what} failed"))
}

// ---------------------------------------------------------------------------
// Token cache
// ---------------------------------------------------------------------------

/// [`TokenCache`] over the shared KeyDB pool.
///
/// Each command is dispatched on one pooled connection; dropping the future
/// abandons the command without leaking the connection.
#[derive(Clone)]
pub struct KeyDbCache {
    pool: Pool,
    timeout: Duration,
}

impl KeyDbCache {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait::async_trait]
impl TokenCache for KeyDbCache {
    async fn read_all_fields(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let map: HashMap<String, String> =
            bounded(self.timeout, "HGETALL", self.pool.hgetall(key)).await?;
        if map.is_empty() {
            trace!(key, "token cache miss");
            return Ok(None);
        }
        trace!(key, "token cache hit");
        Ok(Some(map))
    }

    async fn write_all_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let _: () = bounded(self.timeout, "HSET", self.pool.hset(key, fields.to_vec())).await?;
        Ok(())
    }

    async fn set_expiry(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let ttl = i64::try_from(ttl_secs).context("TTL out of range")?;
        let _: () = bounded(self.timeout, "EXPIRE", self.pool.expire(key, ttl, None)).await?;
        trace!(key, ttl_secs, "token cache expiry set");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _: String = bounded(self.timeout, "PING", self.pool.ping(None)).await?;
        Ok(())
    }
}
