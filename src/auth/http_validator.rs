//! Bearer token validation against the IndieAuth token endpoint.
//!
//! Validates an HTTP `Authorization` header by forwarding it to the configured
//! token endpoint and caching the introspection result in KeyDB under
//! `token:<value>`.  A warm cache entry short-circuits the remote call.
//! Whether the resulting identity is acceptable is left to the caller.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::cache::{token_cache_key, TokenCache};
use crate::auth::token::{bearer_value, Token};
use crate::metrics::{IntrospectionOutcome, Metrics};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization header is not of the form `Bearer <token>`")]
    MalformedHeader,
    #[error("token endpoint unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("token endpoint rejected the token with status {0}")]
    Rejected(u16),
    #[error("token endpoint response could not be decoded: {0}")]
    Decode(String),
    #[error("token belongs to {0}, not to this site")]
    WrongIdentity(String),
}

/// Validates `Authorization` headers, consulting the cache before the
/// token endpoint.
#[derive(Clone)]
pub struct TokenValidator {
    cache: Arc<dyn TokenCache>,
    http_client: reqwest::Client,
    token_endpoint: String,
    cache_ttl: u64,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl TokenValidator {
    pub fn new(
        cache: Arc<dyn TokenCache>,
        http_client: reqwest::Client,
        token_endpoint: impl Into<String>,
        cache_ttl: u64,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            http_client,
            token_endpoint: token_endpoint.into(),
            cache_ttl,
            timeout,
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<dyn TokenCache> {
        &self.cache
    }

    /// Validate an `Authorization` header value.
    ///
    /// 1. Reject anything that is not `Bearer <token>` without any I/O.
    /// 2. Return the cached token if one is stored.
    /// 3. Otherwise ask the token endpoint and cache a successful answer.
    pub async fn validate(&self, auth_header: &str) -> Result<Token, AuthError> {
        let raw_token = bearer_value(auth_header).ok_or(AuthError::MalformedHeader)?;
        let cache_key = token_cache_key(raw_token);

        match self.cache.read_all_fields(&cache_key).await {
            Ok(Some(fields)) => match Token::from_fields(fields) {
                Some(token) => {
                    self.metrics.auth_cache_hits.inc();
                    debug!(me = %token.me, "token cache hit");
                    return Ok(token);
                }
                None => warn!("cached token entry is malformed, re-validating"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "token cache read failed, re-validating"),
        }
        self.metrics.auth_cache_misses.inc();

        let token = self.introspect(auth_header).await?;

        if let Err(e) = self.remember(&cache_key, &token).await {
            self.metrics.auth_cache_write_failures.inc();
            warn!(error = %e, "failed to cache validated token");
        }

        Ok(token)
    }

    async fn introspect(&self, auth_header: &str) -> Result<Token, AuthError> {
        debug!(endpoint = %self.token_endpoint, "checking token with token endpoint");

        let resp = self
            .http_client
            .get(&self.token_endpoint)
            .header(AUTHORIZATION, auth_header)
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                self.metrics.introspection(IntrospectionOutcome::Transport);
                AuthError::Transport(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            self.metrics.introspection(IntrospectionOutcome::Rejected);
            debug!(%status, "token endpoint rejected token");
            return Err(AuthError::Rejected(status.as_u16()));
        }

        let body = resp.bytes().await.map_err(|e| {
            self.metrics.introspection(IntrospectionOutcome::Transport);
            AuthError::Transport(e)
        })?;
        let token: Token = serde_json::from_slice(&body).map_err(|e| {
            self.metrics.introspection(IntrospectionOutcome::Decode);
            AuthError::Decode(e.to_string())
        })?;

        self.metrics.introspection(IntrospectionOutcome::Accepted);
        debug!(me = %token.me, "token endpoint accepted token");
        Ok(token)
    }

    async fn remember(&self, cache_key: &str, token: &Token) -> anyhow::Result<()> {
        self.cache
            .write_all_fields(cache_key, &token.to_fields())
            .await?;
        self.cache.set_expiry(cache_key, self.cache_ttl).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::cache::memory::MemoryCache;
    use crate::metrics::MetricsRegistry;

    pub(crate) const SITE: &str = "https://example.com/";

    pub(crate) fn validator_for(server: &MockServer, cache: Arc<MemoryCache>) -> TokenValidator {
        TokenValidator::new(
            cache,
            reqwest::Client::new(),
            format!("{}/token", server.uri()),
            600,
            Duration::from_secs(5),
            MetricsRegistry::new().metrics,
        )
    }

    pub(crate) async fn mount_token(server: &MockServer, raw: &str, me: &str, expected_calls: u64) {
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("authorization", format!("Bearer {raw}").as_str()))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "me": me,
                "client_id": "https://client.example.net/",
                "scope": "read follow",
                "issued_at": 1_700_000_000,
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn malformed_header_does_no_io() {
        let server = MockServer::start().await;
        let cache = Arc::new(MemoryCache::new());
        let validator = validator_for(&server, Arc::clone(&cache));

        for header in ["", "Bearer ", "Basic abc", "bearer xyz", "Token xyz"] {
            let err = validator.validate(header).await.unwrap_err();
            assert!(matches!(err, AuthError::MalformedHeader), "{header:?}");
        }

        assert_eq!(cache.reads.load(Ordering::SeqCst), 0);
        assert_eq!(cache.writes.load(Ordering::SeqCst), 0);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cold_cache_calls_endpoint_and_caches() {
        let server = MockServer::start().await;
        mount_token(&server, "xyz", SITE, 1).await;
        let cache = Arc::new(MemoryCache::new());
        let validator = validator_for(&server, Arc::clone(&cache));

        let token = validator.validate("Bearer xyz").await.unwrap();
        assert_eq!(token.me, SITE);
        assert_eq!(token.scope, "read follow");
        assert!(cache.contains("token:xyz"));
        assert_eq!(cache.ttl_of("token:xyz").map(|d| d.as_secs() > 590), Some(true));
    }

    #[tokio::test]
    async fn warm_cache_skips_endpoint() {
        let server = MockServer::start().await;
        mount_token(&server, "xyz", SITE, 1).await;
        let cache = Arc::new(MemoryCache::new());
        let validator = validator_for(&server, Arc::clone(&cache));

        validator.validate("Bearer xyz").await.unwrap();
        let again = validator.validate("Bearer xyz").await.unwrap();
        assert_eq!(again.me, SITE);
        // `expect(1)` is verified when the server drops.
    }

    #[tokio::test]
    async fn preloaded_cache_entry_is_trusted() {
        let server = MockServer::start().await;
        let cache = Arc::new(MemoryCache::new());
        cache.insert_raw("token:abc", &[("me", SITE), ("scope", "read")]);
        let validator = validator_for(&server, Arc::clone(&cache));

        let token = validator.validate("Bearer abc").await.unwrap();
        assert_eq!(token.scope, "read");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_entry_falls_back_to_endpoint() {
        let server = MockServer::start().await;
        mount_token(&server, "xyz", SITE, 2).await;
        let cache = Arc::new(MemoryCache::new());
        let validator = validator_for(&server, Arc::clone(&cache));

        validator.validate("Bearer xyz").await.unwrap();
        cache.advance(Duration::from_secs(601));
        assert!(!cache.contains("token:xyz"));

        validator.validate("Bearer xyz").await.unwrap();
        assert!(cache.contains("token:xyz"));
    }

    #[tokio::test]
    async fn malformed_cache_entry_falls_back_to_endpoint() {
        let server = MockServer::start().await;
        mount_token(&server, "xyz", SITE, 1).await;
        let cache = Arc::new(MemoryCache::new());
        cache.insert_raw("token:xyz", &[("scope", "read")]);
        let validator = validator_for(&server, Arc::clone(&cache));

        let token = validator.validate("Bearer xyz").await.unwrap();
        assert_eq!(token.me, SITE);
    }

    #[tokio::test]
    async fn rewritten_entry_drops_garbled_issued_at() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"me": SITE})))
            .expect(1)
            .mount(&server)
            .await;
        let cache = Arc::new(MemoryCache::new());
        cache.insert_raw("token:xyz", &[("me", SITE), ("issued_at", "yesterday")]);
        let validator = validator_for(&server, Arc::clone(&cache));

        let first = validator.validate("Bearer xyz").await.unwrap();
        let second = validator.validate("Bearer xyz").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.issued_at, None);
    }

    #[tokio::test]
    async fn null_optional_fields_are_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "me": SITE,
                "client_id": null,
                "scope": null,
                "issued_at": null,
            })))
            .expect(1)
            .mount(&server)
            .await;
        let cache = Arc::new(MemoryCache::new());
        let validator = validator_for(&server, Arc::clone(&cache));

        let token = validator.validate("Bearer xyz").await.unwrap();
        assert_eq!(token.me, SITE);
        assert!(token.client_id.is_empty());
        assert!(token.scope.is_empty());
        assert_eq!(token.issued_at, None);
        assert!(cache.contains("token:xyz"));
    }

    #[tokio::test]
    async fn cache_read_error_falls_back_to_endpoint() {
        let server = MockServer::start().await;
        mount_token(&server, "xyz", SITE, 1).await;
        let cache = Arc::new(MemoryCache::failing_reads());
        let validator = validator_for(&server, cache);

        assert!(validator.validate("Bearer xyz").await.is_ok());
    }

    #[tokio::test]
    async fn cache_write_error_keeps_success() {
        let server = MockServer::start().await;
        mount_token(&server, "xyz", SITE, 1).await;
        let cache = Arc::new(MemoryCache::failing_writes());
        let validator = validator_for(&server, Arc::clone(&cache));

        let token = validator.validate("Bearer xyz").await.unwrap();
        assert_eq!(token.me, SITE);
        assert_eq!(cache.writes.load(Ordering::SeqCst), 1);
        assert!(!cache.contains("token:xyz"));
    }

    #[tokio::test]
    async fn non_2xx_is_rejection_without_caching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        let cache = Arc::new(MemoryCache::new());
        let validator = validator_for(&server, Arc::clone(&cache));

        let err = validator.validate("Bearer nope").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(401)));
        assert_eq!(cache.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undecodable_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>hi</html>"))
            .mount(&server)
            .await;
        let cache = Arc::new(MemoryCache::new());
        let validator = validator_for(&server, Arc::clone(&cache));

        let err = validator.validate("Bearer xyz").await.unwrap_err();
        assert!(matches!(err, AuthError::Decode(_)));
        assert_eq!(cache.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_without_me_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scope": "read"})))
            .mount(&server)
            .await;
        let validator = validator_for(&server, Arc::new(MemoryCache::new()));

        let err = validator.validate("Bearer xyz").await.unwrap_err();
        assert!(matches!(err, AuthError::Decode(_)));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"me": SITE}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;
        let cache = Arc::new(MemoryCache::new());
        let validator = TokenValidator::new(
            Arc::clone(&cache) as Arc<dyn TokenCache>,
            reqwest::Client::new(),
            format!("{}/token", server.uri()),
            600,
            Duration::from_millis(100),
            MetricsRegistry::new().metrics,
        );

        let err = validator.validate("Bearer xyz").await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
        assert!(!cache.contains("token:xyz"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let validator = TokenValidator::new(
            Arc::new(MemoryCache::new()),
            reqwest::Client::new(),
            "http://127.0.0.1:1/token",
            600,
            Duration::from_secs(2),
            MetricsRegistry::new().metrics,
        );

        let err = validator.validate("Bearer xyz").await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
    }
}
