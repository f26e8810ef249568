mod auth;
mod config;
mod feed;
mod health;
mod http;
mod keydb;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::cache::TokenCache;
use crate::auth::http_validator::TokenValidator;
use crate::config::Config;
use crate::feed::keydb::KeyDbFeedBackend;
use crate::feed::{FeedBackend, FeedDiagnostics};
use crate::http::incoming::Incoming;
use crate::keydb::KeyDbCache;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "feedgate", about = "IndieWeb feed server trust boundary")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/feedgate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.  Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
    pub validator: TokenValidator,
    pub incoming: Arc<Incoming>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        http_client: reqwest::Client,
        metrics: MetricsRegistry,
        cache: Arc<dyn TokenCache>,
        incoming: Incoming,
    ) -> Self {
        let validator = TokenValidator::new(
            cache,
            http_client.clone(),
            config.site.token_endpoint.clone(),
            config.auth.token_cache_ttl,
            Duration::from_secs(config.auth.introspection_timeout_secs),
            Arc::clone(&metrics.metrics),
        );
        Self {
            config,
            metrics,
            http_client,
            validator,
            incoming: Arc::new(incoming),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, site = %config.site.me, "starting feedgate");

    if !config.auth.enabled {
        tracing::warn!("auth.enabled is false: /microsub is served without token checks");
    }

    // ---- Infrastructure clients ----
    let pool = keydb::create_keydb_pool(&config.keydb).await?;
    let command_timeout = Duration::from_millis(config.keydb.command_timeout_ms);

    let http_client = reqwest::Client::builder()
        .user_agent("feedgate/0.1")
        .build()
        .context("failed to build reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Feed backend ----
    let feeds = Arc::new(KeyDbFeedBackend::new(
        pool.clone(),
        command_timeout,
        config.webhook.max_queued_deliveries,
    ));
    let backend: Arc<dyn FeedBackend> = feeds.clone();
    let diagnostics: Arc<dyn FeedDiagnostics> = feeds;
    let incoming = Incoming::new(
        backend,
        config.webhook.allow_unsigned,
        Arc::clone(&metrics.metrics),
    )
    .with_diagnostics(diagnostics);
    tracing::info!(
        allow_unsigned = config.webhook.allow_unsigned,
        "feed backend initialised"
    );

    // ---- App state ----
    let cache: Arc<dyn TokenCache> = Arc::new(KeyDbCache::new(pool, command_timeout));
    let state = AppState::new(Arc::clone(&config), http_client, metrics, cache, incoming);

    run_http_server(state).await?;

    tracing::info!("feedgate shut down cleanly");
    Ok(())
}
