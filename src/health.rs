use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::auth::cache::TokenCache;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub keydb: CheckResult,
    pub token_endpoint: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub cache: Arc<dyn TokenCache>,
    pub http_client: reqwest::Client,
    pub token_endpoint: String,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_keydb(cache: &dyn TokenCache) -> CheckResult {
    match cache.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e:#}")),
    }
}

/// Any HTTP answer counts: the endpoint rejects anonymous requests.
async fn check_token_endpoint(client: &reqwest::Client, url: &str) -> CheckResult {
    match client.head(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) if resp.status().is_server_error() => {
            CheckResult::unhealthy(format!("HEAD {url} returned {}", resp.status()))
        }
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("HEAD {url} failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let all_ok = checks.keydb.ok && checks.token_endpoint.ok;
    // KeyDB holds the feed secrets; without it no delivery can be accepted.
    let any_critical = !checks.keydb.ok;

    if all_ok {
        HealthStatus::Ok
    } else if any_critical {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (keydb, token_endpoint) = tokio::join!(
        check_keydb(state.cache.as_ref()),
        check_token_endpoint(&state.http_client, &state.token_endpoint),
    );

    let checks = HealthChecks {
        keydb,
        token_endpoint,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::cache::memory::MemoryCache;

    fn checks(keydb: bool, token_endpoint: bool) -> HealthChecks {
        let result = |ok| if ok { CheckResult::healthy() } else { CheckResult::unhealthy("down") };
        HealthChecks {
            keydb: result(keydb),
            token_endpoint: result(token_endpoint),
        }
    }

    #[test]
    fn aggregate() {
        assert_eq!(aggregate_status(&checks(true, true)), HealthStatus::Ok);
        assert_eq!(aggregate_status(&checks(true, false)), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&checks(false, true)), HealthStatus::Unhealthy);
        assert_eq!(aggregate_status(&checks(false, false)), HealthStatus::Unhealthy);
    }

    async fn probe(cache: MemoryCache, server: &MockServer) -> (StatusCode, serde_json::Value) {
        let state = HealthState {
            cache: Arc::new(cache),
            http_client: reqwest::Client::new(),
            token_endpoint: format!("{}/token", server.uri()),
        };
        let resp = health_handler(State(state)).await.into_response();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn unauthorized_token_endpoint_is_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (status, body) = probe(MemoryCache::new(), &server).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn failing_token_endpoint_degrades() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let (status, body) = probe(MemoryCache::new(), &server).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"]["token_endpoint"]["ok"], false);
    }

    #[tokio::test]
    async fn keydb_down_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (status, body) = probe(MemoryCache::failing_reads(), &server).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }
}
