//! WebSub subscriber callback: `GET|POST /incoming/{feed_id}`.
//!
//! - `GET` is the hub's verification request: record `hub.lease_seconds`
//!   (if given) and echo `hub.challenge`.
//! - `POST` is a content delivery: resolve the feed secret, verify
//!   `X-Hub-Signature` over the raw body (if present) and hand the body to the
//!   [`FeedBackend`].  A delivery that fails verification never reaches the
//!   backend.
//!
//! This endpoint only answers the hub; it never subscribes.

use std::num::ParseIntError;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::auth::webhook::{verify_signature, SignatureError, SIGNATURE_HEADER};
use crate::feed::{FeedBackend, FeedDiagnostics};
use crate::metrics::{DeliveryOutcome, Metrics};
use crate::AppState;

// ---------------------------------------------------------------------------
// Handler state
// ---------------------------------------------------------------------------

/// Collaborators of the callback, fixed at construction.
pub struct Incoming {
    backend: Arc<dyn FeedBackend>,
    diagnostics: Option<Arc<dyn FeedDiagnostics>>,
    allow_unsigned: bool,
    metrics: Arc<Metrics>,
}

impl Incoming {
    pub fn new(backend: Arc<dyn FeedBackend>, allow_unsigned: bool, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            diagnostics: None,
            allow_unsigned,
            metrics,
        }
    }

    /// Attach the backend's diagnostic capability.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn FeedDiagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum IncomingError {
    #[error("missing feed id")]
    MissingFeedId,
    #[error("invalid feed id {0:?}")]
    InvalidFeedId(String),
    #[error("error in hub.lease_seconds format {0:?}: {1}")]
    InvalidLease(String, #[source] ParseIntError),
    #[error("error while setting hub.lease_seconds: {0:#}")]
    Lease(anyhow::Error),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Unknown")]
    UnknownFeed,
    #[error("could not look up feed: {0:#}")]
    SecretLookup(anyhow::Error),
    #[error("missing X-Hub-Signature header")]
    MissingSignature,
    #[error("Error in signature: {0}")]
    Signature(#[from] SignatureError),
    #[error("Unknown format of body: {content_type} ({reason:#})")]
    Backend {
        content_type: String,
        reason: anyhow::Error,
    },
}

impl IncomingError {
    pub fn status(&self) -> StatusCode {
        match self {
            IncomingError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for IncomingError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// Raw query pairs in request order.
pub type QueryPairs = Vec<(String, String)>;

/// First value of `name`; later repeats are ignored.
pub fn first_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Parse the `{feed_id}` path segment: ASCII digits only.
pub fn parse_feed_id(segment: &str) -> Result<i64, IncomingError> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IncomingError::InvalidFeedId(segment.to_string()));
    }
    segment
        .parse()
        .map_err(|_| IncomingError::InvalidFeedId(segment.to_string()))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET|POST /incoming/{feed_id}`
#[instrument(skip_all, fields(%method, feed = %feed))]
pub async fn handle_incoming(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(feed): Path<String>,
    Query(params): Query<QueryPairs>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, IncomingError> {
    let feed_id = parse_feed_id(&feed)?;
    let incoming = &state.incoming;

    if method == Method::GET {
        return verify_subscription(incoming, feed_id, &params).await;
    }

    if method != Method::POST {
        return Err(IncomingError::MethodNotAllowed);
    }

    receive_delivery(incoming, feed_id, &headers, body).await
}

/// `/incoming` or `/incoming/` without a feed id.
pub async fn handle_missing_feed() -> IncomingError {
    IncomingError::MissingFeedId
}

async fn verify_subscription(
    incoming: &Incoming,
    feed_id: i64,
    params: &[(String, String)],
) -> Result<Response, IncomingError> {
    if let Some(raw) = first_param(params, "hub.lease_seconds").filter(|s| !s.is_empty()) {
        let lease_seconds: i64 = raw
            .parse()
            .map_err(|e| IncomingError::InvalidLease(raw.to_string(), e))?;
        incoming
            .backend
            .set_lease_seconds(feed_id, lease_seconds)
            .await
            .map_err(IncomingError::Lease)?;
        info!(feed_id, lease_seconds, "subscription lease recorded");
    }

    incoming.metrics.webhook_verifications.inc();

    // No challenge means an empty echo, not an error.
    let challenge = first_param(params, "hub.challenge")
        .unwrap_or_default()
        .to_string();
    debug!(feed_id, "answering verification challenge");
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        challenge,
    )
        .into_response())
}

async fn receive_delivery(
    incoming: &Incoming,
    feed_id: i64,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, IncomingError> {
    let metrics = &incoming.metrics;

    let secret = incoming
        .backend
        .secret(feed_id)
        .await
        .map_err(IncomingError::SecretLookup)?
        .filter(|s| !s.is_empty());
    let Some(secret) = secret else {
        warn!(feed_id, "delivery for feed without secret");
        metrics.delivery(DeliveryOutcome::UnknownFeed);
        return Err(IncomingError::UnknownFeed);
    };

    let signed = match headers.get(SIGNATURE_HEADER) {
        Some(value) => {
            let checked = value
                .to_str()
                .map_err(|_| SignatureError::Format)
                .and_then(|signature| verify_signature(signature, &body, &secret));
            if let Err(e) = checked {
                warn!(feed_id, error = %e, "delivery signature rejected");
                debug!(feed_id, error = ?e, "signature mismatch detail");
                metrics.delivery(DeliveryOutcome::BadSignature);
                return Err(e.into());
            }
            true
        }
        None if incoming.allow_unsigned => {
            debug!(feed_id, "accepting unsigned delivery");
            false
        }
        None => {
            warn!(feed_id, "unsigned delivery rejected");
            metrics.delivery(DeliveryOutcome::BadSignature);
            return Err(IncomingError::MissingSignature);
        }
    };

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let size = body.len();
    if let Err(reason) = incoming
        .backend
        .update_feed(feed_id, &content_type, body)
        .await
    {
        warn!(feed_id, %content_type, error = %reason, "backend refused delivery");
        metrics.delivery(DeliveryOutcome::BackendError);
        return Err(IncomingError::Backend {
            content_type,
            reason,
        });
    }

    metrics.delivery(if signed {
        DeliveryOutcome::Accepted
    } else {
        DeliveryOutcome::Unsigned
    });
    info!(feed_id, %content_type, bytes = size, "delivery accepted");

    if let Some(ref diagnostics) = incoming.diagnostics {
        match diagnostics.feed_summary(feed_id).await {
            Ok(summary) => debug!(feed_id, %summary, "feed state after delivery"),
            Err(e) => debug!(feed_id, error = %e, "feed summary unavailable"),
        }
    }

    Ok(StatusCode::OK.into_response())
}
