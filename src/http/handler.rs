//! Main axum router and the non-WebSub handlers.
//!
//! Routes:
//! - `GET|POST /incoming/{feed_id}` - WebSub subscriber callback
//! - `ANY      /microsub`           - Microsub API (token gated)
//! - `GET      /healthz`            - Health check
//! - `GET      /metrics`            - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use serde_json::json;
use tracing::{debug, error, instrument};

use super::incoming;
use crate::auth::middleware::{AuthGateLayer, Gate};
use crate::auth::token::Token;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut microsub = Router::new().route("/microsub", any(handle_microsub));
    if state.config.auth.enabled {
        let gate = Gate::new(
            state.validator.clone(),
            state.config.site.me.clone(),
            Arc::clone(&state.metrics.metrics),
        );
        microsub = microsub.route_layer(AuthGateLayer::new(gate));
    }

    Router::new()
        .merge(microsub)
        // WebSub callback
        .route(
            "/incoming/{feed_id}",
            any(incoming::handle_incoming)
                .layer(DefaultBodyLimit::max(state.config.webhook.max_body_bytes)),
        )
        .route("/incoming", any(incoming::handle_missing_feed))
        .route("/incoming/", any(incoming::handle_missing_feed))
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `/microsub`
///
/// Reports the identity the gate attached to the request.  Channel and
/// timeline operations live in the feed backend, not here.
#[instrument(skip_all, fields(%method))]
async fn handle_microsub(
    State(state): State<Arc<AppState>>,
    method: Method,
    token: Option<Extension<Token>>,
) -> Response {
    match method {
        Method::OPTIONS => (
            StatusCode::NO_CONTENT,
            [(header::ALLOW, "GET, POST, OPTIONS")],
        )
            .into_response(),
        Method::GET => {
            let body = match token {
                Some(Extension(token)) => json!({
                    "me": token.me,
                    "client_id": token.client_id,
                    "scope": token.scope,
                }),
                None => json!({ "me": state.config.site.me }),
            };
            debug!("microsub identity served");
            Json(body).into_response()
        }
        _ => (
            StatusCode::NOT_IMPLEMENTED,
            "Microsub action not supported",
        )
            .into_response(),
    }
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        cache: Arc::clone(state.validator.cache()),
        http_client: state.http_client.clone(),
        token_endpoint: state.config.site.token_endpoint.clone(),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
