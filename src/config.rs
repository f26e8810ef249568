use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub site: SiteConfig,
    pub keydb: KeyDbConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Site identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// The site's identity URL.  A token is only accepted when the `me`
    /// returned by the token endpoint is exactly this value.
    pub me: String,
    /// IndieAuth token endpoint used for bearer token introspection.
    pub token_endpoint: String,
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `redis://keydb:6379`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Upper bound on a single cache round-trip, in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    3
}

fn default_command_timeout_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// Bearer token auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Gate the Microsub API behind bearer token validation.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Lifetime of a cached introspection result, in seconds.
    #[serde(default = "default_token_cache_ttl")]
    pub token_cache_ttl: u64,
    /// Timeout for a single token endpoint call, in seconds.
    #[serde(default = "default_introspection_timeout")]
    pub introspection_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_cache_ttl: default_token_cache_ttl(),
            introspection_timeout_secs: default_introspection_timeout(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_token_cache_ttl() -> u64 {
    600
}

fn default_introspection_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// WebSub callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Accept content deliveries that carry no `X-Hub-Signature` header.
    ///
    /// Hubs that were subscribed without a secret never sign, so the default
    /// keeps accepting them.  Set to `false` to require signed deliveries.
    #[serde(default = "bool_true")]
    pub allow_unsigned: bool,
    /// Maximum accepted request body for a content delivery.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Deliveries kept per feed for the downstream parser.
    #[serde(default = "default_max_queued_deliveries")]
    pub max_queued_deliveries: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            allow_unsigned: true,
            max_body_bytes: default_max_body_bytes(),
            max_queued_deliveries: default_max_queued_deliveries(),
        }
    }
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_max_queued_deliveries() -> i64 {
    100
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.site.me.is_empty(), "site.me must not be empty");

    let endpoint = url::Url::parse(&config.site.token_endpoint)
        .with_context(|| format!("invalid site.token_endpoint: {}", config.site.token_endpoint))?;
    anyhow::ensure!(
        matches!(endpoint.scheme(), "http" | "https"),
        "site.token_endpoint must be an http(s) URL"
    );

    config
        .server
        .http_listen
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid server.http_listen: {}", config.server.http_listen))?;

    anyhow::ensure!(config.keydb.pool_size > 0, "keydb.pool_size must be at least 1");
    anyhow::ensure!(
        config.auth.token_cache_ttl > 0,
        "auth.token_cache_ttl must be greater than zero"
    );
    anyhow::ensure!(
        config.auth.introspection_timeout_secs > 0,
        "auth.introspection_timeout_secs must be greater than zero"
    );
    anyhow::ensure!(
        config.webhook.max_queued_deliveries > 0,
        "webhook.max_queued_deliveries must be greater than zero"
    );
    Ok(())
}
